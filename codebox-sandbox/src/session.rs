//! Execution session lifecycle
//!
//! ```text
//! Pending -> Provisioning -> Running -> Completed | TimedOut | Crashed
//!    |            |
//!    +------------+--> Rejected
//! ```
//!
//! The backend handle lives in a [`HandleGuard`] from the moment provisioning
//! returns it, so every path out of a session disposes it exactly once.

use crate::backend::{Backend, BackendHandle, ExitOutcome, ProvisionSpec};
use crate::capture::{self, PumpOptions, Termination};
use crate::coordinator::Coordinator;
use crate::error::{ProvisionError, RunError, SandboxError, TimeoutError};
use crate::language::{validate_libraries, Language};
use crate::limits::{Limits, ResourceLimiter};
use crate::types::{ExecutionRequest, ExecutionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code reported when the wall clock ran out before the process exited
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[cfg(unix)]
const SIGXCPU: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGXCPU: i32 = 24;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Provisioning,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::TimedOut
                | SessionState::Crashed
                | SessionState::Rejected
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, Rejected)
                | (Provisioning, Running)
                | (Provisioning, Rejected)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Crashed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Provisioning => "provisioning",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::TimedOut => "timed_out",
            SessionState::Crashed => "crashed",
            SessionState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request on its way through the lifecycle
#[derive(Debug)]
pub struct ExecutionSession {
    pub id: SessionId,
    pub request: ExecutionRequest,
    pub backend_handle: Option<BackendHandle>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Wall-clock deadline, set when the session is admitted
    pub deadline: Option<Instant>,
}

impl ExecutionSession {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            id: SessionId::new(),
            request,
            backend_handle: None,
            state: SessionState::Pending,
            started_at: Utc::now(),
            deadline: None,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(session_id = %self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
    }
}

/// Final record of a session. Exactly one per request.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub state: SessionState,
    pub language: Option<Language>,
    pub started_at: DateTime<Utc>,
    /// Present unless the session was rejected
    pub result: Option<ExecutionResult>,
    /// Why the session did not complete normally
    pub error: Option<SandboxError>,
}

/// Timeouts governing a session outside the user code itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(120),
            teardown_timeout: Duration::from_secs(15),
            cancel_grace: Duration::from_secs(2),
            drain_grace: Duration::from_millis(250),
        }
    }
}

/// Scoped ownership of a backend handle
pub struct HandleGuard {
    backend: Arc<dyn Backend>,
    handle: BackendHandle,
    timeout: Duration,
    released: bool,
}

impl HandleGuard {
    pub fn new(backend: Arc<dyn Backend>, handle: BackendHandle, timeout: Duration) -> Self {
        Self {
            backend,
            handle,
            timeout,
            released: false,
        }
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    /// Dispose the handle. The disposal runs as its own task so it finishes
    /// even if this future is dropped.
    pub async fn release(mut self) {
        self.released = true;
        let task = tokio::spawn(dispose_bounded(
            self.backend.clone(),
            self.handle.clone(),
            self.timeout,
        ));
        if let Err(e) = task.await {
            warn!(handle = %self.handle, error = %e, "dispose task failed");
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(handle = %self.handle, "session dropped, disposing in background");
                runtime.spawn(dispose_bounded(
                    self.backend.clone(),
                    self.handle.clone(),
                    self.timeout,
                ));
            }
            Err(_) => warn!(handle = %self.handle, "no runtime to dispose abandoned handle"),
        }
    }
}

async fn dispose_bounded(backend: Arc<dyn Backend>, handle: BackendHandle, timeout: Duration) {
    if tokio::time::timeout(timeout, backend.dispose(&handle))
        .await
        .is_err()
    {
        warn!(handle = %handle, backend = backend.name(), "dispose exceeded teardown timeout");
    }
}

/// Outcome of running code on a provisioned handle
#[derive(Debug, Clone)]
pub(crate) struct RunReport {
    pub state: SessionState,
    pub result: ExecutionResult,
    pub error: Option<SandboxError>,
}

/// Drives sessions from admission to teardown
#[derive(Clone)]
pub struct SessionManager {
    backend: Arc<dyn Backend>,
    limiter: ResourceLimiter,
    coordinator: Coordinator,
    options: SessionOptions,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        limiter: ResourceLimiter,
        coordinator: Coordinator,
        options: SessionOptions,
    ) -> Self {
        Self {
            backend,
            limiter,
            coordinator,
            options,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Run one request to a terminal state
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> SessionRecord {
        self.execute_session(ExecutionSession::new(request), cancel)
            .await
    }

    /// Run an already created session (lets callers pick the id)
    pub async fn execute_session(
        &self,
        mut session: ExecutionSession,
        cancel: CancellationToken,
    ) -> SessionRecord {
        let language = session.request.lang.parse::<Language>();
        let limits = match &language {
            Ok(language) => self.limiter.limits_for(*language, &session.request.limits),
            Err(_) => self.limiter.base_limits(&session.request.limits),
        };
        let arrived = Instant::now();
        session.deadline = Some(arrived + limits.wall_clock);

        // Pending: the queue wait counts against the wall-clock budget.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TimeoutError::QueueWait(arrived.elapsed())),
            permit = self.coordinator.acquire(limits.wall_clock) => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                let error = if cancel.is_cancelled() {
                    SandboxError::from(ProvisionError::Cancelled)
                } else {
                    SandboxError::from(e)
                };
                info!(session_id = %session.id, error = %error, "session rejected before admission");
                session.advance(SessionState::Rejected);
                return rejected(session, language.ok(), error);
            }
        };

        session.advance(SessionState::Provisioning);
        let language = match language {
            Ok(language) => language,
            Err(e) => {
                info!(session_id = %session.id, lang = %session.request.lang, "unsupported language");
                session.advance(SessionState::Rejected);
                return rejected(session, None, e.into());
            }
        };
        let guard = match self
            .provision(language, &session.request, limits, &cancel)
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                info!(session_id = %session.id, error = %e, "provisioning failed");
                session.advance(SessionState::Rejected);
                return rejected(session, Some(language), e.into());
            }
        };
        session.backend_handle = Some(guard.handle().clone());

        session.advance(SessionState::Running);
        info!(
            session_id = %session.id,
            language = %language,
            backend = self.backend.name(),
            handle = %guard.handle(),
            "running code"
        );
        let report = self
            .run_code(guard.handle(), &session.request.code, &limits, &cancel)
            .await;
        guard.release().await;

        session.advance(report.state);
        info!(
            session_id = %session.id,
            state = %report.state,
            exit_code = report.result.exit_code,
            duration_ms = report.result.duration_ms,
            "session finished"
        );
        SessionRecord {
            id: session.id,
            state: report.state,
            language: Some(language),
            started_at: session.started_at,
            result: Some(report.result),
            error: report.error,
        }
    }

    /// Provision a sandbox (libraries included) under the provision timeout
    pub(crate) async fn provision(
        &self,
        language: Language,
        request: &ExecutionRequest,
        limits: Limits,
        cancel: &CancellationToken,
    ) -> Result<HandleGuard, ProvisionError> {
        validate_libraries(&request.libraries)?;
        let spec = ProvisionSpec {
            language,
            libraries: request.libraries.clone(),
            keep_template: request.keep_template,
            limits,
        };

        // Dropping the provision future makes the backend release whatever
        // it had created so far.
        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            result = tokio::time::timeout(
                self.options.provision_timeout,
                self.backend.provision(&spec),
            ) => result,
        };
        let handle = match provisioned {
            Ok(result) => result?,
            Err(_) => return Err(ProvisionError::TimedOut(self.options.provision_timeout)),
        };
        Ok(HandleGuard::new(
            self.backend.clone(),
            handle,
            self.options.teardown_timeout,
        ))
    }

    /// Run `code` on a provisioned handle and classify how it ended
    pub(crate) async fn run_code(
        &self,
        handle: &BackendHandle,
        code: &str,
        limits: &Limits,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let deadline = started + limits.wall_clock;

        // Starting the process is part of the run: the deadline and the
        // cancel token apply to it as well.
        let started_run = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Termination::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Termination::DeadlineExceeded),
            result = self.backend.run(handle, code, limits) => Ok(result),
        };
        let process = match started_run {
            Ok(Ok(process)) => process,
            Err(termination) => {
                warn!(handle = %handle, "run ended before the process started");
                let (state, exit_code, error) = classify(&termination, limits);
                return RunReport {
                    state,
                    result: ExecutionResult {
                        exit_code,
                        timed_out: state == SessionState::TimedOut,
                        duration_ms: elapsed_ms(started),
                        ..Default::default()
                    },
                    error,
                };
            }
            Ok(Err(e)) => {
                warn!(handle = %handle, error = %e, "failed to start code");
                return RunReport {
                    state: SessionState::Crashed,
                    result: ExecutionResult {
                        exit_code: -1,
                        duration_ms: elapsed_ms(started),
                        ..Default::default()
                    },
                    error: Some(e.into()),
                };
            }
        };

        let captured = capture::pump(
            process,
            deadline,
            cancel,
            PumpOptions {
                max_output_bytes: limits.max_output_bytes,
                cancel_grace: self.options.cancel_grace,
                drain_grace: self.options.drain_grace,
            },
        )
        .await;

        let (state, exit_code, error) = classify(&captured.termination, limits);
        RunReport {
            state,
            result: ExecutionResult {
                stdout: captured.stdout,
                stderr: captured.stderr,
                exit_code,
                timed_out: state == SessionState::TimedOut,
                truncated: captured.truncated,
                duration_ms: elapsed_ms(started),
            },
            error,
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.backend.name())
            .field("coordinator", &self.coordinator)
            .field("options", &self.options)
            .finish()
    }
}

/// Map how the process ended to a terminal state, exit code and error
fn classify(
    termination: &Termination,
    limits: &Limits,
) -> (SessionState, i32, Option<SandboxError>) {
    match termination {
        Termination::Exited(ExitOutcome::Exited(code)) => (SessionState::Completed, *code, None),
        Termination::Exited(outcome @ ExitOutcome::Signaled(signal)) if *signal == SIGXCPU => (
            SessionState::TimedOut,
            outcome.code(),
            Some(TimeoutError::CpuTime(limits.cpu_seconds).into()),
        ),
        Termination::Exited(outcome @ ExitOutcome::Signaled(signal)) => (
            SessionState::Crashed,
            outcome.code(),
            Some(RunError::Signaled(*signal).into()),
        ),
        Termination::DeadlineExceeded => (
            SessionState::TimedOut,
            TIMEOUT_EXIT_CODE,
            Some(TimeoutError::WallClock(limits.wall_clock).into()),
        ),
        Termination::Cancelled => (SessionState::Crashed, -1, Some(RunError::Cancelled.into())),
        Termination::Failed(e) => (SessionState::Crashed, -1, Some(e.clone().into())),
    }
}

fn rejected(
    session: ExecutionSession,
    language: Option<Language>,
    error: SandboxError,
) -> SessionRecord {
    SessionRecord {
        id: session.id,
        state: SessionState::Rejected,
        language,
        started_at: session.started_at,
        result: None,
        error: Some(error),
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
