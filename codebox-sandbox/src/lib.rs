//! Codebox Sandbox - sandboxed code execution engine
//!
//! Runs untrusted code in an isolated backend (subprocess jail or container)
//! under CPU, wall-clock, memory and output limits, with bounded concurrency
//! and a structured result for every request.

pub mod assembler;
pub mod backend;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod language;
pub mod limits;
pub mod persistent;
pub mod session;
mod service;
pub mod types;

pub use assembler::{ExecutionResponse, FailureKind};
pub use backend::{create_backend, Backend, BackendHandle, BackendKind, ExitOutcome};
pub use config::{LimitsConfig, SandboxConfig};
pub use coordinator::{Coordinator, CoordinatorStats, SlotPermit};
pub use error::{
    ConfigError, ProvisionError, RunError, SandboxError, SessionError, TimeoutError,
};
pub use language::Language;
pub use limits::{LimitOverrides, Limits, ResourceLimiter};
pub use persistent::{PersistentConfig, SessionInfo};
pub use service::SandboxService;
pub use session::{SessionId, SessionManager, SessionOptions, SessionRecord, SessionState};
pub use types::{ExecutionRequest, ExecutionResult};

#[cfg(feature = "docker")]
pub use backend::{DockerBackend, DockerBackendConfig};
#[cfg(feature = "process")]
pub use backend::{ProcessBackend, ProcessBackendConfig};
#[cfg(any(test, feature = "test-util"))]
pub use backend::scripted::ScriptedBackend;
