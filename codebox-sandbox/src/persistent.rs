//! Long-lived sandbox sessions
//!
//! A persistent session keeps one provisioned handle, and the coordinator
//! slot it was admitted with, across several executions. Sessions are closed
//! explicitly, by the idle reaper, on shutdown, or when a run times out or
//! crashes.

use crate::backend::BackendHandle;
use crate::coordinator::SlotPermit;
use crate::error::{ProvisionError, SandboxError, SessionError};
use crate::language::{validate_libraries, Language};
use crate::limits::{LimitOverrides, Limits};
use crate::session::{HandleGuard, SessionId, SessionManager, SessionRecord, SessionState};
use crate::types::ExecutionRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limits for persistent sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    pub max_sessions: usize,

    /// Close sessions unused for this long
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            idle_ttl: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Public view of a persistent session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub executions: u64,
    pub libraries: Vec<String>,
    pub busy: bool,
}

struct Live {
    guard: HandleGuard,
    permit: SlotPermit,
}

impl Live {
    async fn release(self) {
        self.guard.release().await;
        drop(self.permit);
    }
}

/// A session's handle checked out for one execution. If the execution is
/// abandoned before the lease is returned, the session is dropped from the
/// registry and its handle and slot are released.
struct Lease<'a> {
    sessions: &'a PersistentSessions,
    id: SessionId,
    live: Option<Live>,
}

impl Lease<'_> {
    async fn finish(mut self, libraries: &[String], close: bool) {
        if let Some(live) = self.live.take() {
            self.sessions.restore(self.id, live, libraries, close).await;
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.live.is_some() {
            self.sessions.sessions().remove(&self.id);
            debug!(session_id = %self.id, "execution abandoned, session closed");
        }
    }
}

struct Entry {
    info: SessionInfo,
    limits: Limits,
    /// `None` while an execution has the handle
    live: Option<Live>,
    closing: bool,
    idle_since: Instant,
}

/// Registry of persistent sessions
pub struct PersistentSessions {
    manager: SessionManager,
    config: PersistentConfig,
    sessions: Mutex<HashMap<SessionId, Entry>>,
}

impl PersistentSessions {
    pub fn new(manager: SessionManager, config: PersistentConfig) -> Self {
        Self {
            manager,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Admit and provision a new session
    pub async fn create(
        &self,
        lang: &str,
        keep_template: bool,
        overrides: &LimitOverrides,
    ) -> Result<SessionInfo, SessionError> {
        if self.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }
        let language = lang
            .parse::<Language>()
            .map_err(SandboxError::from)?;
        let limits = self.manager.limiter().limits_for(language, overrides);

        let permit = self
            .manager
            .coordinator()
            .acquire(limits.wall_clock)
            .await
            .map_err(SandboxError::from)?;
        let request = ExecutionRequest::new(String::new())
            .with_lang(language.as_str())
            .with_keep_template(keep_template);
        let guard = self
            .manager
            .provision(language, &request, limits, &CancellationToken::new())
            .await
            .map_err(SandboxError::from)?;

        let now = Utc::now();
        let info = SessionInfo {
            id: SessionId::new(),
            language,
            created_at: now,
            last_used_at: now,
            executions: 0,
            libraries: Vec::new(),
            busy: false,
        };
        let live = Live { guard, permit };

        let rejected = {
            let mut sessions = self.sessions();
            if sessions.len() >= self.config.max_sessions {
                Some(live)
            } else {
                sessions.insert(
                    info.id,
                    Entry {
                        info: info.clone(),
                        limits,
                        live: Some(live),
                        closing: false,
                        idle_since: Instant::now(),
                    },
                );
                None
            }
        };
        if let Some(live) = rejected {
            live.release().await;
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        info!(session_id = %info.id, language = %language, "persistent session created");
        Ok(info)
    }

    /// Install `libraries` (if any) and run `code` in session `id`
    pub async fn execute(
        &self,
        id: SessionId,
        code: &str,
        libraries: &[String],
        cancel: CancellationToken,
    ) -> Result<SessionRecord, SessionError> {
        let (live, limits, language) = {
            let mut sessions = self.sessions();
            let entry = sessions
                .get_mut(&id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let live = entry
                .live
                .take()
                .ok_or_else(|| SessionError::Busy(id.to_string()))?;
            entry.info.busy = true;
            (live, entry.limits, entry.info.language)
        };
        let handle = live.guard.handle().clone();
        let lease = Lease {
            sessions: self,
            id,
            live: Some(live),
        };
        let started_at = Utc::now();

        if !libraries.is_empty() {
            if let Err(e) = self.install(&handle, libraries).await {
                info!(session_id = %id, error = %e, "library installation failed");
                lease.finish(&[], false).await;
                return Ok(SessionRecord {
                    id,
                    state: SessionState::Rejected,
                    language: Some(language),
                    started_at,
                    result: None,
                    error: Some(e.into()),
                });
            }
        }

        let report = self
            .manager
            .run_code(&handle, code, &limits, &cancel)
            .await;
        let broken = matches!(report.state, SessionState::TimedOut | SessionState::Crashed);
        if broken {
            info!(session_id = %id, state = %report.state, "closing session after failed run");
        }
        lease.finish(libraries, broken).await;

        Ok(SessionRecord {
            id,
            state: report.state,
            language: Some(language),
            started_at,
            result: Some(report.result),
            error: report.error,
        })
    }

    async fn install(
        &self,
        handle: &BackendHandle,
        libraries: &[String],
    ) -> Result<(), ProvisionError> {
        validate_libraries(libraries)?;
        let timeout = self.manager.options().provision_timeout;
        match tokio::time::timeout(
            timeout,
            self.manager.backend().install(handle, libraries),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::TimedOut(timeout)),
        }
    }

    /// Hand the handle back after an execution, or tear the session down
    async fn restore(&self, id: SessionId, live: Live, libraries: &[String], close: bool) {
        let teardown = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&id) {
                Some(entry) if !close && !entry.closing => {
                    entry.info.busy = false;
                    entry.info.executions += 1;
                    entry.info.last_used_at = Utc::now();
                    entry.info.libraries.extend(libraries.iter().cloned());
                    entry.idle_since = Instant::now();
                    entry.live = Some(live);
                    None
                }
                _ => {
                    sessions.remove(&id);
                    Some(live)
                }
            }
        };
        if let Some(live) = teardown {
            live.release().await;
            debug!(session_id = %id, "persistent session released");
        }
    }

    /// Close session `id`. Returns whether it existed. A busy session is
    /// released once its current execution returns.
    pub async fn close(&self, id: SessionId) -> bool {
        let live = {
            let mut sessions = self.sessions();
            let Some(entry) = sessions.get_mut(&id) else {
                return false;
            };
            match entry.live.take() {
                Some(live) => {
                    sessions.remove(&id);
                    Some(live)
                }
                None => {
                    entry.closing = true;
                    None
                }
            }
        };
        if let Some(live) = live {
            live.release().await;
        }
        info!(session_id = %id, "persistent session closed");
        true
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions()
            .values()
            .filter(|entry| !entry.closing)
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Close idle sessions unused for longer than the TTL. Returns how many
    /// were closed.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<(SessionId, Live)> = {
            let mut sessions = self.sessions();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.live.is_some() && entry.idle_since.elapsed() >= self.config.idle_ttl
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let live = sessions.remove(&id)?.live?;
                    Some((id, live))
                })
                .collect()
        };

        let count = expired.len();
        for (id, live) in expired {
            info!(session_id = %id, "closing idle session");
            live.release().await;
        }
        count
    }

    /// Run [`Self::reap_idle`] every `reap_interval` until `stop` fires
    pub fn spawn_reaper(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let sessions = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(sessions) = sessions.upgrade() else {
                    break;
                };
                let closed = sessions.reap_idle().await;
                if closed > 0 {
                    debug!(closed, "idle reaper pass");
                }
            }
        })
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let live: Vec<Live> = {
            let mut sessions = self.sessions();
            let mut live = Vec::new();
            for entry in sessions.values_mut() {
                entry.closing = true;
                if let Some(l) = entry.live.take() {
                    live.push(l);
                }
            }
            sessions.retain(|_, entry| entry.live.is_some() || entry.info.busy);
            live
        };
        if !live.is_empty() {
            warn!(count = live.len(), "closing persistent sessions on shutdown");
        }
        for l in live {
            l.release().await;
        }
    }
}
