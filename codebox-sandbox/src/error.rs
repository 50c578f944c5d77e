//! Error taxonomy for sandboxed execution
//!
//! Provisioning failures abort a session before any user code runs, run
//! failures happen after the process was started, and timeouts cover both the
//! admission queue and the wall clock.

use std::time::Duration;
use thiserror::Error;

/// Failures while preparing a sandbox (maps to `Rejected`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("Invalid library name '{0}'")]
    InvalidLibrary(String),

    #[error("Language '{0}' does not support library installation")]
    LibrariesUnsupported(String),

    #[error("Backend '{0}' has no free sandbox capacity")]
    CapacityExhausted(String),

    #[error("Failed to fetch image '{image}': {reason}")]
    ImageFetch { image: String, reason: String },

    #[error("Library installation failed: {0}")]
    LibraryInstall(String),

    #[error("Provisioning did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Provisioning cancelled")]
    Cancelled,

    #[error("Backend failure: {0}")]
    Backend(String),
}

impl ProvisionError {
    /// Whether the failure was caused by the request itself rather than the backend
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProvisionError::UnsupportedLanguage(_)
                | ProvisionError::InvalidLibrary(_)
                | ProvisionError::LibrariesUnsupported(_)
        )
    }
}

impl From<std::io::Error> for ProvisionError {
    fn from(err: std::io::Error) -> Self {
        ProvisionError::Backend(err.to_string())
    }
}

/// Failures after the sandbox was provisioned (maps to `Crashed`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Failed to start process: {0}")]
    Spawn(String),

    #[error("Process terminated by signal {0}")]
    Signaled(i32),

    #[error("Unknown sandbox handle {0}")]
    UnknownHandle(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Backend failure: {0}")]
    Backend(String),
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        RunError::Backend(err.to_string())
    }
}

/// Time budget exhausted (maps to `TimedOut`, or `Rejected` for the queue)
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Execution exceeded wall-clock limit of {0:?}")]
    WallClock(Duration),

    #[error("Execution exceeded CPU time limit of {0}s")]
    CpuTime(u64),

    #[error("Request waited in queue longer than {0:?}")]
    QueueWait(Duration),
}

/// Any failure a session can end with
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Errors from persistent session management
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session '{0}' not found")]
    NotFound(String),

    #[error("Session limit of {0} reached")]
    LimitReached(usize),

    #[error("Session '{0}' is busy")]
    Busy(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Invalid engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
