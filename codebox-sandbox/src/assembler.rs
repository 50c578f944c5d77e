//! Maps session records to the external response shape

use crate::error::{ProvisionError, SandboxError, TimeoutError};
use crate::session::{SessionRecord, SessionState};
use serde::{Deserialize, Serialize};

/// Exit code reported for sessions that never ran
pub const REJECTED_EXIT_CODE: i32 = -1;

/// Response for one execution, produced for every terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: SessionState,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration_ms: i64,

    /// Failure class for the transport layer; `None` when the code ran
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

/// Why a request produced no run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request itself is unusable (language, library names)
    InvalidRequest,
    /// No capacity within the request's time budget
    Unavailable,
    /// Anything else that stopped provisioning
    Internal,
}

impl ExecutionResponse {
    /// Build the response for a finished session
    pub fn from_record(record: &SessionRecord) -> Self {
        let message = record.error.as_ref().map(|e| e.to_string());
        match (&record.result, record.state) {
            (Some(result), state) => ExecutionResponse {
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
                message: message.or_else(|| {
                    (result.exit_code != 0)
                        .then(|| format!("Process exited with code {}", result.exit_code))
                }),
                status: state,
                timed_out: result.timed_out,
                truncated: result.truncated,
                duration_ms: result.duration_ms,
                failure: None,
            },
            (None, state) => ExecutionResponse {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: REJECTED_EXIT_CODE,
                message: Some(message.unwrap_or_else(|| format!("Execution {}", state))),
                status: state,
                timed_out: false,
                truncated: false,
                duration_ms: 0,
                failure: Some(
                    record
                        .error
                        .as_ref()
                        .map_or(FailureKind::Internal, FailureKind::of),
                ),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SessionState::Completed && self.exit_code == 0
    }
}

impl From<&SessionRecord> for ExecutionResponse {
    fn from(record: &SessionRecord) -> Self {
        Self::from_record(record)
    }
}

impl FailureKind {
    /// Failure class of an error that stopped a request before it ran
    pub fn of(error: &SandboxError) -> Self {
        match error {
            SandboxError::Provision(e) if e.is_client_error() => FailureKind::InvalidRequest,
            SandboxError::Provision(ProvisionError::CapacityExhausted(_))
            | SandboxError::Timeout(TimeoutError::QueueWait(_)) => FailureKind::Unavailable,
            _ => FailureKind::Internal,
        }
    }
}
