//! End-to-end tests against a listening server
//!
//! The server is bound to an ephemeral port and driven over real HTTP, so
//! these cover serving, header propagation and graceful shutdown.

use codebox_sandbox::ScriptedBackend;
use codebox_server::{start_server, ServerState};
use codebox_tests::common::scripted_service;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct RunningServer {
    base_url: String,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn spawn_server(backend: &ScriptedBackend) -> RunningServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let state = ServerState::new(scripted_service(backend, 2));
    let task = tokio::spawn(start_server(listener, state, shutdown.clone()));

    RunningServer {
        base_url: format!("http://{}", addr),
        shutdown,
        task,
    }
}

#[tokio::test]
async fn test_execute_over_http() {
    let backend = ScriptedBackend::new();
    let server = spawn_server(&backend).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/sandbox/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let response = client
        .post(format!("{}/sandbox/execute", server.base_url))
        .json(&json!({ "code": "out:over the wire" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-execution-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["stdout"], "over the wire\n");

    server.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let backend = ScriptedBackend::new();
    let server = spawn_server(&backend).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{}/sandbox/sessions", server.base_url))
        .json(&json!({ "lang": "sh" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    assert_eq!(backend.live_handles(), 1);

    server.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(backend.live_handles(), 0);
    assert_eq!(backend.dispose_calls(), 1);
}
