//! Execution backends
//!
//! A backend is the isolation substrate (subprocess jail, container). The
//! rest of the engine only sees the capability set below and opaque handles.

#[cfg(feature = "docker")]
mod docker;
#[cfg(feature = "process")]
mod process;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use crate::error::{ProvisionError, RunError};
use crate::language::Language;
use crate::limits::Limits;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "docker")]
pub use docker::{DockerBackend, DockerBackendConfig};
#[cfg(feature = "process")]
pub use process::{ProcessBackend, ProcessBackendConfig};

/// A lazy, finite sequence of output bytes from one stream
pub type OutputStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Opaque token addressing one sandbox inside a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle(uuid::Uuid);

impl BackendHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short form used in container and directory names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for BackendHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to prepare before code can run
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub language: Language,
    pub libraries: Vec<String>,
    pub keep_template: bool,
    pub limits: Limits,
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    /// Shell-style exit code (128+N for signal N)
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(signal) => 128 + signal,
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            (None, None) => ExitOutcome::Exited(-1),
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        ExitOutcome::Exited(status.code().unwrap_or(-1))
    }
}

/// Control over a started process
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for the process to end. Must be cancel-safe.
    async fn wait(&mut self) -> Result<ExitOutcome, RunError>;

    /// Ask the process to stop
    async fn terminate(&mut self);

    /// Stop the process now
    async fn kill(&mut self);
}

/// A started process: two independent output streams plus control
pub struct RunningProcess {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub control: Box<dyn ProcessControl>,
}

/// Isolation substrate abstraction
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Prepare a sandbox, including installation of `spec.libraries`.
    /// Dropping the returned future releases anything partially created.
    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle, ProvisionError>;

    /// Install more libraries into an existing sandbox
    async fn install(
        &self,
        handle: &BackendHandle,
        libraries: &[String],
    ) -> Result<(), ProvisionError>;

    /// Start `code` under `limits` and return its output streams
    async fn run(
        &self,
        handle: &BackendHandle,
        code: &str,
        limits: &Limits,
    ) -> Result<RunningProcess, RunError>;

    /// Release everything tied to `handle`. Idempotent, never fails, bounded
    /// by the backend's own timeout.
    async fn dispose(&self, handle: &BackendHandle);
}

/// Backend technology, chosen by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Process,
    Docker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Process => f.write_str("process"),
            BackendKind::Docker => f.write_str("docker"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(BackendKind::Process),
            "docker" => Ok(BackendKind::Docker),
            other => Err(crate::error::ConfigError::Invalid(format!(
                "unknown backend '{}', expected process or docker",
                other
            ))),
        }
    }
}

/// Last `max_chars` characters of tool output, for error messages
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}

/// Build the configured backend
pub fn create_backend(
    config: &crate::config::SandboxConfig,
) -> Result<Arc<dyn Backend>, crate::error::ConfigError> {
    let backend: Arc<dyn Backend> = match config.backend {
        #[cfg(feature = "process")]
        BackendKind::Process => Arc::new(ProcessBackend::new(config.process.clone())),

        #[cfg(not(feature = "process"))]
        BackendKind::Process => {
            return Err(crate::error::ConfigError::Invalid(
                "process backend not compiled in".to_string(),
            ))
        }

        #[cfg(feature = "docker")]
        BackendKind::Docker => Arc::new(DockerBackend::new(config.docker.clone())),

        #[cfg(not(feature = "docker"))]
        BackendKind::Docker => {
            return Err(crate::error::ConfigError::Invalid(
                "docker backend not compiled in".to_string(),
            ))
        }
    };
    Ok(backend)
}
