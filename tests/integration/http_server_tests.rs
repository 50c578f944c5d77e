//! Integration tests for the sandbox HTTP router
//!
//! Requests go straight into the axum router via `tower::ServiceExt::oneshot`;
//! the engine runs over the scripted backend.

use axum::http::StatusCode;
use codebox_sandbox::{ProvisionError, ScriptedBackend};
use codebox_tests::common::{scripted_router, send, wait_until};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_health() {
    let router = scripted_router(&ScriptedBackend::new(), 2);
    let response = send(&router, "GET", "/sandbox/health", None).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["backend"], "scripted");
    assert_eq!(response.body["capacity"]["capacity"], 2);
    assert_eq!(response.body["capacity"]["active"], 0);
    let timestamp = response.body["timestamp"].as_str().unwrap();
    assert!(chrono_like(timestamp), "{}", timestamp);
}

fn chrono_like(timestamp: &str) -> bool {
    timestamp.len() >= 20 && timestamp.as_bytes()[4] == b'-' && timestamp.contains('T')
}

#[tokio::test]
async fn test_execute_completed() {
    let router = scripted_router(&ScriptedBackend::new(), 2);
    let response = send(
        &router,
        "POST",
        "/sandbox/execute",
        Some(r#"{"code": "out:hi", "lang": "python"}"#),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["stdout"], "hi\n");
    assert_eq!(response.body["stderr"], "");
    assert_eq!(response.body["exit_code"], 0);
    assert_eq!(response.body["status"], "completed");
    assert!(response.body.get("message").is_none());
    assert_eq!(response.execution_id.as_deref().map(str::len), Some(36));
}

#[tokio::test]
async fn test_execute_defaults_to_python() {
    let router = scripted_router(&ScriptedBackend::new(), 1);
    let response = send(&router, "POST", "/sandbox/execute", Some(r#"{"code": "exit:3"}"#)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["exit_code"], 3);
    assert_eq!(response.body["message"], "Process exited with code 3");
}

#[tokio::test]
async fn test_execute_validation() {
    let backend = ScriptedBackend::new();
    let router = scripted_router(&backend, 1);

    for body in [
        r#"{"lang": "python"}"#,
        r#"{"code": ""}"#,
        r#"{"code": "#,
        r#"{"code": "out:x", "limits": {"bogus": 1}}"#,
        "",
    ] {
        let response = send(&router, "POST", "/sandbox/execute", Some(body)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "body {:?}", body);
        assert!(response.body["error"].is_string());
        assert!(response.execution_id.is_none());
    }
    assert_eq!(backend.provision_calls(), 0);
}

#[tokio::test]
async fn test_execute_unsupported_language() {
    let backend = ScriptedBackend::new();
    let router = scripted_router(&backend, 1);
    let response = send(
        &router,
        "POST",
        "/sandbox/execute",
        Some(r#"{"code": "x", "lang": "cobol-legacy"}"#),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["status"], "rejected");
    assert_eq!(response.body["exit_code"], -1);
    assert!(response.body["message"]
        .as_str()
        .unwrap()
        .contains("cobol-legacy"));
    assert_eq!(backend.provision_calls(), 0);
}

#[tokio::test]
async fn test_execute_invalid_library() {
    let router = scripted_router(&ScriptedBackend::new(), 1);
    let response = send(
        &router,
        "POST",
        "/sandbox/execute",
        Some(r#"{"code": "out:x", "libraries": ["--index-url=http://evil"]}"#),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["status"], "rejected");
}

#[tokio::test]
async fn test_execute_timeout_and_limits() {
    let router = scripted_router(&ScriptedBackend::new(), 1);
    let body = json!({
        "code": "out:partial\nhang",
        "limits": { "wall_clock_secs": 1 },
    });
    let response = send(
        &router,
        "POST",
        "/sandbox/execute",
        Some(&body.to_string()),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "timed_out");
    assert_eq!(response.body["timed_out"], true);
    assert_eq!(response.body["exit_code"], 124);
    assert_eq!(response.body["stdout"], "partial\n");
}

#[tokio::test]
async fn test_execute_provision_failure() {
    let backend = ScriptedBackend::new().fail_provisioning(ProvisionError::Backend(
        "docker daemon not running".into(),
    ));
    let router = scripted_router(&backend, 1);
    let response = send(&router, "POST", "/sandbox/execute", Some(r#"{"code": "out:x"}"#)).await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body["status"], "rejected");
}

#[tokio::test]
async fn test_execute_queue_timeout_is_unavailable() {
    let backend = ScriptedBackend::new();
    let router = scripted_router(&backend, 1);

    let blocker = {
        let router = router.clone();
        tokio::spawn(async move {
            send(
                &router,
                "POST",
                "/sandbox/execute",
                Some(r#"{"code": "sleep:2500"}"#),
            )
            .await
        })
    };
    wait_until(|| backend.running() == 1).await;

    let response = send(
        &router,
        "POST",
        "/sandbox/execute",
        Some(r#"{"code": "out:x", "limits": {"wall_clock_secs": 1}}"#),
    )
    .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["status"], "rejected");

    let blocker = tokio::time::timeout(Duration::from_secs(10), blocker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocker.status, StatusCode::OK);
}

#[tokio::test]
async fn test_session_routes() {
    let backend = ScriptedBackend::new();
    let router = scripted_router(&backend, 2);

    let created = send(
        &router,
        "POST",
        "/sandbox/sessions",
        Some(r#"{"lang": "javascript"}"#),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["language"], "javascript");
    let id = created.body["id"].as_str().unwrap().to_string();

    let listed = send(&router, "GET", "/sandbox/sessions", None).await;
    assert_eq!(listed.status, StatusCode::OK);
    assert_eq!(listed.body["sessions"].as_array().unwrap().len(), 1);

    let executed = send(
        &router,
        "POST",
        &format!("/sandbox/sessions/{}/execute", id),
        Some(r#"{"code": "out:in session", "libraries": ["lodash"]}"#),
    )
    .await;
    assert_eq!(executed.status, StatusCode::OK);
    assert_eq!(executed.body["stdout"], "in session\n");

    let missing_code = send(
        &router,
        "POST",
        &format!("/sandbox/sessions/{}/execute", id),
        Some("{}"),
    )
    .await;
    assert_eq!(missing_code.status, StatusCode::BAD_REQUEST);

    let closed = send(&router, "DELETE", &format!("/sandbox/sessions/{}", id), None).await;
    assert_eq!(closed.status, StatusCode::NO_CONTENT);

    let again = send(&router, "DELETE", &format!("/sandbox/sessions/{}", id), None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(backend.live_handles(), 0);
}

#[tokio::test]
async fn test_session_errors() {
    let router = scripted_router(&ScriptedBackend::new(), 2);

    let bad_id = send(&router, "POST", "/sandbox/sessions/nope/execute", Some(r#"{"code": "x"}"#)).await;
    assert_eq!(bad_id.status, StatusCode::NOT_FOUND);

    let unknown = send(
        &router,
        "POST",
        "/sandbox/sessions/7f1b6a0e-2c43-4e55-9c0b-3f6f0f3a9d10/execute",
        Some(r#"{"code": "x"}"#),
    )
    .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);

    let unsupported = send(
        &router,
        "POST",
        "/sandbox/sessions",
        Some(r#"{"lang": "cobol-legacy"}"#),
    )
    .await;
    assert_eq!(unsupported.status, StatusCode::BAD_REQUEST);

    // The shared test config allows a single persistent session.
    let first = send(&router, "POST", "/sandbox/sessions", None).await;
    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(first.body["language"], "python");
    let second = send(&router, "POST", "/sandbox/sessions", None).await;
    assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);
}
