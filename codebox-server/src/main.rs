use anyhow::Result;
use clap::{Parser, Subcommand};
use codebox_sandbox::{BackendKind, SessionState};
use codebox_server::{run_exec_app, run_server_app, ExecArgs, ServeArgs};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codebox")]
#[command(about = "Sandboxed code execution service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Configuration file (default: ~/.config/codebox/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Execution backend (process, docker)
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Maximum concurrent executions
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Run a single file in the sandbox and exit with its code
    Exec {
        /// Script to run
        file: PathBuf,

        /// Language (guessed from the extension when omitted)
        #[arg(short, long)]
        lang: Option<String>,

        /// Library to install before running (repeatable)
        #[arg(short = 'L', long = "library")]
        libraries: Vec<String>,

        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Execution backend (process, docker)
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            backend,
            max_concurrent,
            verbose,
            log_file,
        } => {
            run_server_app(ServeArgs {
                config,
                host,
                port,
                backend,
                max_concurrent,
                verbose,
                log_file,
            })
            .await
        }
        Commands::Exec {
            file,
            lang,
            libraries,
            config,
            backend,
            verbose,
        } => {
            let response = run_exec_app(ExecArgs {
                config,
                file,
                lang,
                libraries,
                backend,
                verbose,
            })
            .await?;

            print!("{}", response.stdout);
            eprint!("{}", response.stderr);
            if response.status != SessionState::Completed {
                if let Some(message) = &response.message {
                    eprintln!("codebox: {} ({})", message, response.status);
                }
            }
            std::io::stdout().flush()?;
            std::process::exit(response.exit_code)
        }
    }
}
