//! Common test utilities shared across integration and E2E tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use codebox_sandbox::{
    BackendKind, ProcessBackendConfig, SandboxConfig, SandboxService, ScriptedBackend,
};
use codebox_server::{create_router, ServerState};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("codebox_sandbox=debug,codebox_server=debug")
        .with_test_writer()
        .try_init();
}

/// Engine configuration with `max_concurrent` slots and one persistent session
pub fn sandbox_config(max_concurrent: usize) -> SandboxConfig {
    let mut config = SandboxConfig {
        max_concurrent,
        ..Default::default()
    };
    config.sessions.max_sessions = 1;
    config
}

/// Service over a scripted backend
pub fn scripted_service(backend: &ScriptedBackend, max_concurrent: usize) -> SandboxService {
    SandboxService::new(Arc::new(backend.clone()), &sandbox_config(max_concurrent))
        .expect("valid config")
}

/// Service over the process backend, with workspaces under `root`
pub fn process_service(root: &Path, max_concurrent: usize) -> SandboxService {
    let mut config = sandbox_config(max_concurrent);
    config.backend = BackendKind::Process;
    config.process = ProcessBackendConfig {
        work_root: Some(root.to_path_buf()),
        ..Default::default()
    };
    SandboxService::from_config(&config).expect("valid config")
}

/// Router over a scripted backend
pub fn scripted_router(backend: &ScriptedBackend, max_concurrent: usize) -> Router {
    create_router(ServerState::new(scripted_service(backend, max_concurrent)))
}

/// Whether `program` can be found on PATH
pub fn has_command(program: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {}", program))
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Response captured from a router call
pub struct TestResponse {
    pub status: StatusCode,
    pub execution_id: Option<String>,
    pub body: Value,
}

/// Send one request through the router
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> TestResponse {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .expect("valid request");

    let response = router.clone().oneshot(request).await.expect("infallible");
    let status = response.status();
    let execution_id = response
        .headers()
        .get(codebox_server::http_server::EXECUTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };

    TestResponse {
        status,
        execution_id,
        body,
    }
}

/// Poll `condition` every few milliseconds, failing after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
