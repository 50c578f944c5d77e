//! Process-based backend
//!
//! Each sandbox is a private temporary workspace. Code runs as a child
//! process in its own process group with a scrubbed environment and rlimits
//! applied between fork and exec.

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
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: u64 = 256;

/// Settings for the process backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Parent directory for workspaces and templates (system temp dir when unset)
    pub work_root: Option<PathBuf>,

    /// Maximum number of live sandboxes
    pub max_sandboxes: usize,

    /// PATH visible inside the sandbox
    pub path: String,

    /// Upper bound for one library installation
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,

    /// Upper bound for workspace removal
    #[serde(with = "humantime_serde")]
    pub dispose_timeout: Duration,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            max_sandboxes: 64,
            path: DEFAULT_PATH.to_string(),
            install_timeout: Duration::from_secs(300),
            dispose_timeout: Duration::from_secs(10),
        }
    }
}

struct Sandbox {
    language: Language,
    workspace: TempDir,
    library_roots: Vec<PathBuf>,
    keep_template: bool,
    /// Process group of the current run, 0 when none was started
    pgid: Arc<AtomicI32>,
}

/// Subprocess jail backend
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    sandboxes: Mutex<HashMap<BackendHandle, Sandbox>>,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self {
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<BackendHandle, Sandbox>> {
        self.sandboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn work_root(&self) -> PathBuf {
        self.config
            .work_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("codebox"))
    }

    /// Number of live sandboxes
    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes().len()
    }

    fn base_command(&self, program: &str, home: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(home)
            .env_clear()
            .env("PATH", &self.config.path)
            .env("HOME", home)
            .env("TMPDIR", home)
            .env("LANG", "C.UTF-8")
            .kill_on_drop(true);
        cmd
    }

    async fn run_install(
        &self,
        language: Language,
        target: &Path,
        libraries: &[String],
    ) -> Result<(), ProvisionError> {
        let argv = language.install_command(target, libraries)?;
        debug!(language = %language, libraries = ?libraries, "installing libraries");

        let mut cmd = self.base_command(&argv[0], target);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.config.install_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::LibraryInstall(format!(
                    "failed to start {}: {}",
                    argv[0], e
                )))
            }
            Err(_) => {
                return Err(ProvisionError::LibraryInstall(format!(
                    "installation exceeded {:?}",
                    self.config.install_timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::LibraryInstall(tail(stderr.trim(), 500)));
        }
        Ok(())
    }

    /// Install into the shared template cache, reusing a previous install of
    /// the same library set. Returns the template root.
    async fn install_template(
        &self,
        language: Language,
        libraries: &[String],
    ) -> Result<Option<PathBuf>, ProvisionError> {
        let Some(key) = template_key(language, libraries) else {
            return Ok(None);
        };
        let templates = self.work_root().join("templates");
        let target = templates.join(&key);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(template = %key, "reusing library template");
            return Ok(Some(target));
        }

        tokio::fs::create_dir_all(&templates).await?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&templates)?;
        self.run_install(language, staging.path(), libraries).await?;

        // Another session may have published the same template meanwhile.
        let staged = staging.into_path();
        match tokio::fs::rename(&staged, &target).await {
            Ok(()) => Ok(Some(target)),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staged).await;
                if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    Ok(Some(target))
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(ProcessBackendConfig::default())
    }
}

/// Removes a half-provisioned sandbox if provisioning does not finish
struct Registration<'a> {
    backend: &'a ProcessBackend,
    handle: Option<BackendHandle>,
}

impl Registration<'_> {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(sandbox) = self.backend.sandboxes().remove(&handle) {
                signal_group(&sandbox.pgid, libc::SIGKILL);
            }
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle, ProvisionError> {
        validate_libraries(&spec.libraries)?;
        if spec.language == Language::Shell && !spec.libraries.is_empty() {
            return Err(ProvisionError::LibrariesUnsupported(spec.language.to_string()));
        }

        let root = self.work_root();
        tokio::fs::create_dir_all(&root).await?;
        let workspace = tempfile::Builder::new()
            .prefix("codebox-")
            .tempdir_in(&root)?;

        let handle = BackendHandle::new();
        {
            let mut sandboxes = self.sandboxes();
            if sandboxes.len() >= self.config.max_sandboxes {
                return Err(ProvisionError::CapacityExhausted(self.name().to_string()));
            }
            sandboxes.insert(
                handle.clone(),
                Sandbox {
                    language: spec.language,
                    workspace,
                    library_roots: Vec::new(),
                    keep_template: spec.keep_template,
                    pgid: Arc::new(AtomicI32::new(0)),
                },
            );
        }
        let registration = Registration {
            backend: self,
            handle: Some(handle.clone()),
        };

        self.install(&handle, &spec.libraries).await?;
        registration.disarm();

        debug!(handle = %handle, language = %spec.language, "process sandbox provisioned");
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

        let (language, workspace, keep_template) = {
            let sandboxes = self.sandboxes();
            let sandbox = sandboxes
                .get(handle)
                .ok_or_else(|| ProvisionError::Backend(format!("unknown handle {}", handle)))?;
            (
                sandbox.language,
                sandbox.workspace.path().to_path_buf(),
                sandbox.keep_template,
            )
        };

        let template = if keep_template {
            self.install_template(language, libraries).await?
        } else {
            None
        };
        let root = match template {
            Some(root) => root,
            None => {
                self.run_install(language, &workspace, libraries).await?;
                workspace
            }
        };

        let mut sandboxes = self.sandboxes();
        if let Some(sandbox) = sandboxes.get_mut(handle) {
            if !sandbox.library_roots.contains(&root) {
                sandbox.library_roots.push(root);
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        handle: &BackendHandle,
        code: &str,
        limits: &Limits,
    ) -> Result<RunningProcess, RunError> {
        let (language, workspace, roots, pgid) = {
            let sandboxes = self.sandboxes();
            let sandbox = sandboxes
                .get(handle)
                .ok_or_else(|| RunError::UnknownHandle(handle.to_string()))?;
            (
                sandbox.language,
                sandbox.workspace.path().to_path_buf(),
                sandbox.library_roots.clone(),
                sandbox.pgid.clone(),
            )
        };

        let script = workspace.join(language.script_name());
        tokio::fs::write(&script, code).await?;

        let interpreter = language.interpreter();
        let mut cmd = self.base_command(interpreter[0], &workspace);
        cmd.args(&interpreter[1..])
            .args(language.memory_flags(limits.memory_bytes))
            .arg(&script)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .envs(language.library_env(&roots))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let plan = RlimitPlan {
            cpu_seconds: limits.cpu_seconds,
            address_space: language
                .tolerates_address_space_limit()
                .then_some(limits.memory_bytes),
            file_size: limits.memory_bytes,
        };
        // SAFETY: the closure only calls getrlimit/setrlimit, which are
        // async-signal-safe, and does not allocate.
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&plan));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {}", interpreter[0], e)))?;
        let pid = child.id().map(|pid| pid as i32).unwrap_or(0);
        pgid.store(pid, Ordering::SeqCst);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Backend("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Backend("stderr was not captured".to_string()))?;

        debug!(handle = %handle, pid, "process started");

        Ok(RunningProcess {
            stdout: ReaderStream::new(stdout).boxed(),
            stderr: ReaderStream::new(stderr).boxed(),
            control: Box::new(ChildControl { child, pgid }),
        })
    }

    async fn dispose(&self, handle: &BackendHandle) {
        let removed = self.sandboxes().remove(handle);
        let Some(sandbox) = removed else {
            return;
        };
        signal_group(&sandbox.pgid, libc::SIGKILL);

        let cleanup = tokio::task::spawn_blocking(move || sandbox.workspace.close());
        match tokio::time::timeout(self.config.dispose_timeout, cleanup).await {
            Ok(Ok(Ok(()))) => debug!(handle = %handle, "process sandbox disposed"),
            Ok(Ok(Err(e))) => warn!(handle = %handle, error = %e, "failed to remove workspace"),
            Ok(Err(e)) => warn!(handle = %handle, error = %e, "workspace cleanup task failed"),
            Err(_) => warn!(handle = %handle, "workspace cleanup timed out"),
        }
    }
}

struct ChildControl {
    child: Child,
    pgid: Arc<AtomicI32>,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn wait(&mut self) -> Result<ExitOutcome, RunError> {
        let status = self.child.wait().await?;
        // A group id can be reused once its last member is gone.
        if !group_alive(&self.pgid) {
            self.pgid.store(0, Ordering::SeqCst);
        }
        Ok(ExitOutcome::from_status(status))
    }

    async fn terminate(&mut self) {
        signal_group(&self.pgid, libc::SIGTERM);
    }

    async fn kill(&mut self) {
        signal_group(&self.pgid, libc::SIGKILL);
        let _ = self.child.start_kill();
    }
}

fn group_alive(pgid: &AtomicI32) -> bool {
    let pgid = pgid.load(Ordering::SeqCst);
    // SAFETY: signal 0 only checks that the group exists.
    pgid > 0 && unsafe { libc::killpg(pgid, 0) } == 0
}

fn signal_group(pgid: &AtomicI32, signal: libc::c_int) {
    let pgid = pgid.load(Ordering::SeqCst);
    if pgid > 0 {
        // SAFETY: killpg has no memory-safety preconditions.
        unsafe {
            libc::killpg(pgid, signal);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_seconds: u64,
    address_space: Option<u64>,
    file_size: u64,
}

/// Applies `plan` in the child. Limits are clamped to the inherited hard
/// limit since an unprivileged process cannot raise it.
fn apply_rlimits(plan: &RlimitPlan) -> std::io::Result<()> {
    macro_rules! set_rlimit {
        ($resource:expr, $soft:expr, $hard:expr) => {{
            let mut soft = $soft as libc::rlim_t;
            let mut hard = $hard as libc::rlim_t;
            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::getrlimit($resource, &mut current) } == 0
                && current.rlim_max != libc::RLIM_INFINITY
            {
                hard = hard.min(current.rlim_max);
                soft = soft.min(hard);
            }
            let limit = libc::rlimit {
                rlim_cur: soft,
                rlim_max: hard,
            };
            if unsafe { libc::setrlimit($resource, &limit) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }};
    }

    // SIGXCPU at the soft limit, SIGKILL one second later.
    set_rlimit!(libc::RLIMIT_CPU, plan.cpu_seconds, plan.cpu_seconds + 1);
    if let Some(bytes) = plan.address_space {
        set_rlimit!(libc::RLIMIT_AS, bytes, bytes);
    }
    set_rlimit!(libc::RLIMIT_FSIZE, plan.file_size, plan.file_size);
    set_rlimit!(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES);
    set_rlimit!(libc::RLIMIT_CORE, 0, 0);
    Ok(())
}

/// Directory name for a language + library set. Characters outside a safe
/// set are percent-encoded so distinct specs never share a template.
fn template_key(language: Language, libraries: &[String]) -> Option<String> {
    let mut names = Vec::with_capacity(libraries.len());
    for library in libraries {
        let mut encoded = String::with_capacity(library.len());
        for c in library.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                encoded.push(c);
            } else if c.is_ascii() {
                encoded.push_str(&format!("%{:02X}", c as u32));
            } else {
                return None;
            }
        }
        names.push(encoded);
    }
    names.sort();
    names.dedup();
    let key = format!("{}-{}", language, names.join("+"));
    (key.len() <= 200).then_some(key)
}
