//! Sandbox service - main entry point

use crate::assembler::ExecutionResponse;
use crate::backend::{create_backend, Backend};
use crate::config::SandboxConfig;
use crate::coordinator::{Coordinator, CoordinatorStats};
use crate::error::{ConfigError, SessionError};
use crate::limits::LimitOverrides;
use crate::persistent::{PersistentSessions, SessionInfo};
use crate::session::{ExecutionSession, SessionId, SessionManager};
use crate::types::ExecutionRequest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sandboxed code execution: one-shot runs plus persistent sessions
#[derive(Clone)]
pub struct SandboxService {
    manager: SessionManager,
    sessions: Arc<PersistentSessions>,
    shutdown: CancellationToken,
}

impl SandboxService {
    /// Build the configured backend and wrap it in a service
    pub fn from_config(config: &SandboxConfig) -> Result<Self, ConfigError> {
        let backend = create_backend(config)?;
        Self::new(backend, config)
    }

    /// Create a service over an existing backend
    pub fn new(backend: Arc<dyn Backend>, config: &SandboxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = SessionManager::new(
            backend,
            config.limits.limiter()?,
            Coordinator::new(config.max_concurrent),
            config.timeouts,
        );
        tracing::info!(
            backend = manager.backend().name(),
            max_concurrent = config.max_concurrent,
            "sandbox service ready"
        );
        Ok(Self {
            sessions: Arc::new(PersistentSessions::new(manager.clone(), config.sessions)),
            manager,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn backend_name(&self) -> &str {
        self.manager.backend().name()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.manager.coordinator().stats()
    }

    /// Execute code and return the response
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        self.execute_with_id(SessionId::new(), request, CancellationToken::new())
            .await
    }

    /// Execute with a caller-chosen id; `cancel` stops the session at any stage
    pub async fn execute_with_id(
        &self,
        id: SessionId,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResponse {
        tracing::info!(
            session_id = %id,
            lang = %request.lang,
            code_len = request.code.len(),
            libraries = request.libraries.len(),
            "Executing code"
        );
        let mut session = ExecutionSession::new(request);
        session.id = id;
        let record = self.manager.execute_session(session, cancel).await;
        ExecutionResponse::from_record(&record)
    }

    /// Open a persistent session
    pub async fn create_session(
        &self,
        lang: &str,
        keep_template: bool,
        limits: &LimitOverrides,
    ) -> Result<SessionInfo, SessionError> {
        self.sessions.create(lang, keep_template, limits).await
    }

    /// Run code inside a persistent session
    pub async fn execute_in_session(
        &self,
        id: SessionId,
        code: &str,
        libraries: &[String],
    ) -> Result<ExecutionResponse, SessionError> {
        let record = self
            .sessions
            .execute(id, code, libraries, self.shutdown.child_token())
            .await?;
        Ok(ExecutionResponse::from_record(&record))
    }

    pub async fn close_session(&self, id: SessionId) -> bool {
        self.sessions.close(id).await
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    /// Start closing idle persistent sessions in the background
    pub fn start_reaper(&self) -> tokio::task::JoinHandle<()> {
        self.sessions.spawn_reaper(self.shutdown.child_token())
    }

    /// Stop the reaper, cancel running session executions and close every
    /// persistent session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.shutdown().await;
    }
}

impl std::fmt::Debug for SandboxService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxService")
            .field("manager", &self.manager)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
