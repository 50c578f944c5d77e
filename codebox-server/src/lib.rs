//! Codebox Server - HTTP boundary and CLI for the sandbox engine

use anyhow::{Context, Result};
use codebox_sandbox::{BackendKind, ExecutionRequest, ExecutionResponse, SandboxService};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub mod config;
pub mod http_server;

pub use config::AppConfig;
pub use http_server::{create_router, start_server, ServerState};

/// Options for `codebox serve`; CLI values override the config file
#[derive(Debug, Default)]
pub struct ServeArgs {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<BackendKind>,
    pub max_concurrent: Option<usize>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

/// Options for `codebox exec`
#[derive(Debug)]
pub struct ExecArgs {
    pub config: Option<PathBuf>,
    pub file: PathBuf,
    pub lang: Option<String>,
    pub libraries: Vec<String>,
    pub backend: Option<BackendKind>,
    pub verbose: bool,
}

/// Install the global subscriber: stderr always, plus `log_file` when given.
/// The returned guard flushes the file writer and must outlive the program.
pub fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "codebox_sandbox={},codebox_server={},tower_http={}",
                    level, level, level
                ))
            }),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn log_level(verbose: bool, config: &AppConfig) -> &str {
    if verbose {
        "debug"
    } else {
        &config.logging.level
    }
}

/// Run the HTTP server until Ctrl-C
pub async fn run_server_app(args: ServeArgs) -> Result<()> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.sandbox.max_concurrent = max_concurrent;
    }
    if args.log_file.is_some() {
        config.logging.file = args.log_file;
    }

    let _guard = init_tracing(log_level(args.verbose, &config), config.logging.file.as_deref())?;

    let sandbox_config = config.sandbox_config();
    let service = SandboxService::from_config(&sandbox_config)
        .context("Failed to initialize sandbox service")?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal.cancel();
    });

    start_server(listener, ServerState::new(service), shutdown).await
}

/// Run one file through the engine and return the response
pub async fn run_exec_app(args: ExecArgs) -> Result<ExecutionResponse> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    let _guard = init_tracing(
        if args.verbose { "debug" } else { "warn" },
        config.logging.file.as_deref(),
    )?;

    let code = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let lang = args
        .lang
        .or_else(|| lang_from_extension(&args.file).map(str::to_string))
        .unwrap_or_else(|| "python".to_string());

    let mut request = ExecutionRequest::new(code).with_lang(lang);
    request.libraries = args.libraries;

    let service = SandboxService::from_config(&config.sandbox_config())
        .context("Failed to initialize sandbox service")?;
    let response = service.execute(request).await;
    service.shutdown().await;
    Ok(response)
}

/// Guess the language from a script's extension
pub fn lang_from_extension(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "py" => Some("python"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "sh" | "bash" => Some("shell"),
        _ => None,
    }
}
