//! HTTP server exposing the sandbox
//!
//! `POST /sandbox/execute` runs one request to completion. The session routes
//! manage long-lived sandboxes that keep installed libraries between runs.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use codebox_sandbox::{
    ExecutionRequest, ExecutionResponse, FailureKind, LimitOverrides, SandboxService, SessionError,
    SessionId,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Response header carrying the id assigned to an execution
pub const EXECUTION_ID_HEADER: &str = "x-execution-id";

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct ServerState {
    service: SandboxService,
}

impl ServerState {
    pub fn new(service: SandboxService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &SandboxService {
        &self.service
    }
}

/// Errors raised at the HTTP boundary
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body is malformed or incomplete
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::Busy(_)) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::LimitReached(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Session(SessionError::Sandbox(e)) => failure_status(FailureKind::of(e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn failure_status(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidRequest => StatusCode::BAD_REQUEST,
        FailureKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Caller-requested limits; the engine clamps them to its ceiling
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsBody {
    pub cpu_seconds: Option<u64>,
    pub wall_clock_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

impl From<LimitsBody> for LimitOverrides {
    fn from(body: LimitsBody) -> Self {
        LimitOverrides {
            cpu_seconds: body.cpu_seconds,
            wall_clock: body.wall_clock_secs.map(Duration::from_secs),
            memory_bytes: body.memory_bytes,
            max_output_bytes: body.max_output_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    code: Option<String>,
    #[serde(default = "default_lang")]
    lang: String,
    #[serde(default)]
    keep_template: bool,
    #[serde(default)]
    libraries: Vec<String>,
    #[serde(default)]
    limits: Option<LimitsBody>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default = "default_lang")]
    lang: String,
    #[serde(default)]
    keep_template: bool,
    #[serde(default)]
    limits: Option<LimitsBody>,
}

#[derive(Debug, Deserialize)]
struct SessionExecuteBody {
    code: Option<String>,
    #[serde(default)]
    libraries: Vec<String>,
}

fn default_lang() -> String {
    "python".to_string()
}

/// Parse a JSON body; an empty body counts as `{}`
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid request body: {}", e)))
}

fn require_code(code: Option<String>) -> Result<String, ApiError> {
    match code {
        Some(code) if !code.trim().is_empty() => Ok(code),
        _ => Err(ApiError::Validation("Field 'code' is required".to_string())),
    }
}

fn session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Session(SessionError::NotFound(raw.to_string())))
}

fn execution_response(response: ExecutionResponse) -> (StatusCode, Json<ExecutionResponse>) {
    let status = response.failure.map_or(StatusCode::OK, failure_status);
    (status, Json(response))
}

/// Create the sandbox router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/sandbox/health", get(handle_health))
        .route("/sandbox/execute", post(handle_execute))
        .route(
            "/sandbox/sessions",
            post(handle_create_session).get(handle_list_sessions),
        )
        .route("/sandbox/sessions/:id", delete(handle_close_session))
        .route("/sandbox/sessions/:id/execute", post(handle_session_execute))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires, then close every persistent session
pub async fn start_server(
    listener: tokio::net::TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = state.service.clone();
    let reaper = service.start_reaper();
    let app = create_router(state);

    let bind_addr = listener
        .local_addr()
        .context("Failed to obtain sandbox server bind address")?;
    info!(%bind_addr, backend = service.backend_name(), "Starting sandbox server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Sandbox server error")?;

    info!("Sandbox server stopped, closing sessions");
    service.shutdown().await;
    if let Err(e) = reaper.await {
        warn!(error = %e, "session reaper did not stop cleanly");
    }
    Ok(())
}

async fn handle_health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backend": state.service.backend_name(),
        "capacity": state.service.stats(),
    }))
}

async fn handle_execute(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: ExecuteBody = parse_body(&body)?;
    let code = require_code(body.code)?;

    let mut request = ExecutionRequest::new(code)
        .with_lang(body.lang)
        .with_keep_template(body.keep_template)
        .with_limits(body.limits.map(Into::into).unwrap_or_default());
    request.libraries = body.libraries;

    let id = SessionId::new();
    let response = state
        .service
        .execute_with_id(id, request, CancellationToken::new())
        .await;

    let mut response = execution_response(response).into_response();
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(EXECUTION_ID_HEADER, value);
    }
    Ok(response)
}

async fn handle_create_session(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: CreateSessionBody = parse_body(&body)?;
    let overrides: LimitOverrides = body.limits.map(Into::into).unwrap_or_default();
    let info = state
        .service
        .create_session(&body.lang, body.keep_template, &overrides)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn handle_list_sessions(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.service.list_sessions() }))
}

async fn handle_session_execute(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id = session_id(&id)?;
    let body: SessionExecuteBody = parse_body(&body)?;
    let code = require_code(body.code)?;
    let response = state
        .service
        .execute_in_session(id, &code, &body.libraries)
        .await?;
    Ok(execution_response(response))
}

async fn handle_close_session(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = session_id(&id)?;
    if state.service.close_session(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SessionError::NotFound(id.to_string()).into())
    }
}
