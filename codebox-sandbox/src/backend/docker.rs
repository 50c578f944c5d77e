//! Container backend driven through the `docker` CLI
//!
//! One long-lived container per sandbox (`sleep infinity`), code delivered
//! and run with `docker exec`. The container is attached to the bridge
//! network only while libraries install.
//!
//! `docker exec` only reports an exit code, so a signal death of the inner
//! process (128+N) cannot be told apart from code exiting with that value
//! itself. Codes 129..=159 are read as signals: `sys.exit(137)` in a
//! container reports as a crash by SIGKILL.

use super::{
    tail, Backend, BackendHandle, ExitOutcome, ProcessControl, ProvisionSpec, RunningProcess,
};
use crate::error::{ProvisionError, RunError};
use crate::language::{validate_libraries, Language};
use crate::limits::Limits;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const SANDBOX_DIR: &str = "/sandbox";
const BRIDGE_NETWORK: &str = "bridge";

/// Settings for the docker backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerBackendConfig {
    /// Container CLI binary
    pub cli: String,

    /// Image per language name; falls back to the language default
    pub images: HashMap<String, String>,

    /// Prefix for container names
    pub container_prefix: String,

    /// CPU share per container
    pub cpus: f64,

    /// Maximum processes per container
    pub pids_limit: u32,

    /// User the code runs as inside the container
    pub user: Option<String>,

    /// Detach containers from every network except during installation
    pub network_isolation: bool,

    /// Maximum number of live containers
    pub max_containers: usize,

    /// Upper bound for short CLI calls (create, copy, network changes)
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pull_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub dispose_timeout: Duration,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            cli: "docker".to_string(),
            images: HashMap::new(),
            container_prefix: "codebox".to_string(),
            cpus: 1.0,
            pids_limit: 128,
            user: Some("65534:65534".to_string()),
            network_isolation: true,
            max_containers: 32,
            command_timeout: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(300),
            dispose_timeout: Duration::from_secs(10),
        }
    }
}

struct Container {
    name: String,
    language: Language,
    image: String,
    /// Image was pulled for this sandbox and may be removed with it
    pulled: bool,
    keep_template: bool,
    networked: bool,
}

/// Container backend
pub struct DockerBackend {
    config: DockerBackendConfig,
    containers: Mutex<HashMap<BackendHandle, Container>>,
}

impl DockerBackend {
    pub fn new(config: DockerBackendConfig) -> Self {
        Self {
            config,
            containers: Mutex::new(HashMap::new()),
        }
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<BackendHandle, Container>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn image_for(&self, language: Language) -> String {
        self.config
            .images
            .get(language.as_str())
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }

    fn container_name(&self, handle: &BackendHandle) -> String {
        format!("{}-{}", self.config.container_prefix, handle.short())
    }

    /// Number of live containers
    pub fn live_containers(&self) -> usize {
        self.containers().len()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.cli);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a CLI command to completion, returning trimmed stderr on failure
    async fn cli(&self, args: &[String], timeout: Duration) -> Result<String, String> {
        let output = match tokio::time::timeout(timeout, self.command().args(args).output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to run {}: {}", self.config.cli, e)),
            Err(_) => {
                return Err(format!(
                    "{} {} timed out after {:?}",
                    self.config.cli,
                    args.first().map(String::as_str).unwrap_or_default(),
                    timeout
                ))
            }
        };
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    /// Make sure `image` is present locally. Returns whether it was pulled.
    async fn ensure_image(&self, image: &str) -> Result<bool, ProvisionError> {
        let inspect = vec!["image".into(), "inspect".into(), image.to_string()];
        if self.cli(&inspect, self.config.command_timeout).await.is_ok() {
            return Ok(false);
        }

        info!(image, "pulling sandbox image");
        self.cli(&["pull".into(), image.to_string()], self.config.pull_timeout)
            .await
            .map_err(|reason| ProvisionError::ImageFetch {
                image: image.to_string(),
                reason,
            })?;
        Ok(true)
    }

    fn run_args(&self, name: &str, image: &str, limits: &Limits) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--network".to_string(),
            BRIDGE_NETWORK.to_string(),
            "--memory".to_string(),
            limits.memory_bytes.to_string(),
            "--memory-swap".to_string(),
            limits.memory_bytes.to_string(),
            "--cpus".to_string(),
            self.config.cpus.to_string(),
            "--pids-limit".to_string(),
            self.config.pids_limit.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--tmpfs".to_string(),
            format!(
                "{}:rw,exec,mode=1777,size={}",
                SANDBOX_DIR, limits.memory_bytes
            ),
            "-w".to_string(),
            SANDBOX_DIR.to_string(),
            "-e".to_string(),
            format!("HOME={}", SANDBOX_DIR),
        ];
        if let Some(user) = &self.config.user {
            args.extend(["--user".to_string(), user.clone()]);
        }
        args.push(image.to_string());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    fn exec_args(&self, name: &str, language: Language, limits: &Limits) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            SANDBOX_DIR.to_string(),
            "-e".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        for (key, value) in language.library_env(&[Path::new(SANDBOX_DIR)]) {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }

        let mut argv: Vec<String> = language.interpreter().iter().map(|s| s.to_string()).collect();
        argv.extend(language.memory_flags(limits.memory_bytes));
        argv.push(language.script_name().to_string());

        args.push(name.to_string());
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            format!("ulimit -t {}; exec {}", limits.cpu_seconds, argv.join(" ")),
        ]);
        args
    }

    async fn set_network(&self, name: &str, attach: bool) -> Result<(), String> {
        let verb = if attach { "connect" } else { "disconnect" };
        let args = vec![
            "network".to_string(),
            verb.to_string(),
            BRIDGE_NETWORK.to_string(),
            name.to_string(),
        ];
        self.cli(&args, self.config.command_timeout).await.map(|_| ())
    }

    async fn remove_container(&self, name: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        if let Err(e) = self.cli(&args, self.config.dispose_timeout).await {
            warn!(container = name, error = %e, "failed to remove container");
        }
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new(DockerBackendConfig::default())
    }
}

/// Removes a container if provisioning does not finish
struct Registration<'a> {
    backend: &'a DockerBackend,
    handle: Option<BackendHandle>,
}

impl Registration<'_> {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let removed = self.backend.containers().remove(&handle);
        let Some(container) = removed else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container = %container.name, "no runtime to remove abandoned container");
            return;
        };
        let cli = self.backend.config.cli.clone();
        runtime.spawn(async move {
            let _ = Command::new(cli)
                .args(["rm", "-f", &container.name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        });
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle, ProvisionError> {
        validate_libraries(&spec.libraries)?;
        if spec.language == Language::Shell && !spec.libraries.is_empty() {
            return Err(ProvisionError::LibrariesUnsupported(spec.language.to_string()));
        }

        let handle = BackendHandle::new();
        let name = self.container_name(&handle);
        let image = self.image_for(spec.language);
        {
            let mut containers = self.containers();
            if containers.len() >= self.config.max_containers {
                return Err(ProvisionError::CapacityExhausted(self.name().to_string()));
            }
            containers.insert(
                handle.clone(),
                Container {
                    name: name.clone(),
                    language: spec.language,
                    image: image.clone(),
                    pulled: false,
                    keep_template: spec.keep_template,
                    networked: true,
                },
            );
        }
        let registration = Registration {
            backend: self,
            handle: Some(handle.clone()),
        };

        let pulled = self.ensure_image(&image).await?;
        if let Some(container) = self.containers().get_mut(&handle) {
            container.pulled = pulled;
        }

        self.cli(
            &self.run_args(&name, &image, &spec.limits),
            self.config.command_timeout,
        )
        .await
        .map_err(|e| ProvisionError::Backend(format!("failed to start container: {}", e)))?;

        self.install(&handle, &spec.libraries).await?;
        if self.config.network_isolation {
            self.set_network(&name, false)
                .await
                .map_err(|e| ProvisionError::Backend(format!("failed to isolate network: {}", e)))?;
            if let Some(container) = self.containers().get_mut(&handle) {
                container.networked = false;
            }
        }
        registration.disarm();

        debug!(handle = %handle, container = %name, image = %image, "container provisioned");
        Ok(handle)
    }

    async fn install(
        &self,
        handle: &BackendHandle,
        libraries: &[String],
    ) -> Result<(), ProvisionError> {
        validate_libraries(libraries)?;
        if libraries.is_empty() {
            return Ok(());
        }

        let (name, language, networked) = {
            let containers = self.containers();
            let container = containers
                .get(handle)
                .ok_or_else(|| ProvisionError::Backend(format!("unknown handle {}", handle)))?;
            (container.name.clone(), container.language, container.networked)
        };
        let argv = language.install_command(Path::new(SANDBOX_DIR), libraries)?;

        if !networked {
            self.set_network(&name, true)
                .await
                .map_err(|e| ProvisionError::LibraryInstall(format!("network unavailable: {}", e)))?;
        }

        debug!(container = %name, libraries = ?libraries, "installing libraries");
        let mut args = vec!["exec".to_string(), name.clone()];
        args.extend(argv);
        let result = self.cli(&args, self.config.install_timeout).await;

        if !networked {
            if let Err(e) = self.set_network(&name, false).await {
                return Err(ProvisionError::Backend(format!(
                    "failed to isolate network: {}",
                    e
                )));
            }
        }
        result
            .map(|_| ())
            .map_err(|e| ProvisionError::LibraryInstall(tail(&e, 500)))
    }

    async fn run(
        &self,
        handle: &BackendHandle,
        code: &str,
        limits: &Limits,
    ) -> Result<RunningProcess, RunError> {
        let (name, language) = {
            let containers = self.containers();
            let container = containers
                .get(handle)
                .ok_or_else(|| RunError::UnknownHandle(handle.to_string()))?;
            (container.name.clone(), container.language)
        };

        // Deliver the script over stdin so no host path is shared.
        let target = format!("{}/{}", SANDBOX_DIR, language.script_name());
        let mut copy = self.command();
        copy.args(["exec", "-i", &name, "sh", "-c"])
            .arg(format!("cat > {}", target))
            .stdin(Stdio::piped());
        let mut child = copy
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {}", self.config.cli, e)))?;
        let stdin = child.stdin.take();
        let copied = tokio::time::timeout(self.config.command_timeout, async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(code.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        })
        .await;
        let output = copied
            .map_err(|_| RunError::Backend("timed out copying code into container".to_string()))??;
        if !output.status.success() {
            return Err(RunError::Backend(format!(
                "failed to copy code into container: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut child = self
            .command()
            .args(self.exec_args(&name, language, limits))
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {}", self.config.cli, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Backend("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Backend("stderr was not captured".to_string()))?;

        debug!(handle = %handle, container = %name, "container process started");

        Ok(RunningProcess {
            stdout: ReaderStream::new(stdout).boxed(),
            stderr: ReaderStream::new(stderr).boxed(),
            control: Box::new(ExecControl {
                child,
                cli: self.config.cli.clone(),
                container: name,
                timeout: self.config.command_timeout,
            }),
        })
    }

    async fn dispose(&self, handle: &BackendHandle) {
        let removed = self.containers().remove(handle);
        let Some(container) = removed else {
            return;
        };
        self.remove_container(&container.name).await;

        if container.pulled && !container.keep_template {
            let args = vec!["rmi".to_string(), container.image.clone()];
            match self.cli(&args, self.config.dispose_timeout).await {
                Ok(_) => debug!(image = %container.image, "removed pulled image"),
                // Usually still in use by another sandbox.
                Err(e) => debug!(image = %container.image, error = %e, "kept pulled image"),
            }
        }
        debug!(handle = %handle, container = %container.name, "container disposed");
    }
}

/// Control over a `docker exec` process. Signals are delivered inside the
/// container since killing the CLI alone would leave the code running.
struct ExecControl {
    child: Child,
    cli: String,
    container: String,
    /// Upper bound for one signalling call
    timeout: Duration,
}

impl ExecControl {
    async fn signal_all(&self, signal: &str) {
        let status = Command::new(&self.cli)
            .args(["exec", &self.container, "sh", "-c"])
            .arg(format!("kill -{} -1", signal))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(container = %self.container, error = %e, "failed to signal container processes")
            }
            Err(_) => warn!(container = %self.container, signal, "signalling container timed out"),
        }
    }
}

#[async_trait]
impl ProcessControl for ExecControl {
    async fn wait(&mut self) -> Result<ExitOutcome, RunError> {
        let status = self.child.wait().await?;
        Ok(exec_outcome(status.code()))
    }

    async fn terminate(&mut self) {
        self.signal_all("TERM").await;
    }

    async fn kill(&mut self) {
        self.signal_all("KILL").await;
        let _ = self.child.start_kill();
    }
}

/// `docker exec` reports a signal death of the inner process as 128+N;
/// an explicit exit with such a code reads the same
fn exec_outcome(code: Option<i32>) -> ExitOutcome {
    match code {
        Some(code @ 129..=159) => ExitOutcome::Signaled(code - 128),
        Some(code) => ExitOutcome::Exited(code),
        None => ExitOutcome::Signaled(libc::SIGKILL),
    }
}
