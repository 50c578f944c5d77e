//! Engine behaviour across coordinator, session manager and assembler
//!
//! These tests drive `SandboxService` over the scripted backend, so they
//! exercise admission, state transitions and teardown without spawning
//! real processes.

use assert_matches::assert_matches;
use codebox_sandbox::{
    ExecutionRequest, FailureKind, LimitOverrides, ProvisionError, SandboxService,
    ScriptedBackend, SessionError, SessionId, SessionState,
};
use codebox_tests::common::{scripted_service, setup_test_logging, wait_until};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn spawn_execute(
    service: &SandboxService,
    code: &str,
) -> tokio::task::JoinHandle<codebox_sandbox::ExecutionResponse> {
    let service = service.clone();
    let request = ExecutionRequest::new(code);
    tokio::spawn(async move { service.execute(request).await })
}

#[tokio::test]
async fn test_completed_request() {
    setup_test_logging();
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 2);

    let response = service
        .execute(ExecutionRequest::new("out:hi\nerr:warn"))
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert_eq!(response.stdout, "hi\n");
    assert_eq!(response.stderr, "warn\n");
    assert_eq!(response.exit_code, 0);
    assert!(!response.timed_out);
    assert!(response.is_success());
    assert_eq!(backend.provision_calls(), 1);
    assert_eq!(backend.live_handles(), 0);
}

#[tokio::test]
async fn test_third_request_waits_for_a_free_slot() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 2);

    let a = spawn_execute(&service, "sleep:300\nout:a");
    let b = spawn_execute(&service, "sleep:300\nout:b");
    wait_until(|| backend.running() == 2).await;

    let c = spawn_execute(&service, "out:c");
    wait_until(|| service.stats().queued == 1).await;

    // C is held in the queue: nothing was provisioned for it yet.
    assert_eq!(backend.provision_calls(), 2);
    assert_eq!(service.stats().active, 2);

    let (a, b, c) = (a.await.unwrap(), b.await.unwrap(), c.await.unwrap());
    assert_eq!(a.stdout, "a\n");
    assert_eq!(b.stdout, "b\n");
    assert_eq!(c.status, SessionState::Completed);
    assert_eq!(c.stdout, "c\n");

    assert_eq!(backend.provision_calls(), 3);
    assert!(backend.peak_running() <= 2);
    assert_eq!(service.stats().active, 0);
}

#[tokio::test]
async fn test_fifo_admission() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = spawn_execute(&service, "sleep:200");
    wait_until(|| backend.running() == 1).await;

    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let waiter = service.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let response = waiter
                .execute(ExecutionRequest::new(format!("out:{}", name)))
                .await;
            order.lock().unwrap().push(response.stdout);
        }));
        let queued = waiters.len();
        wait_until(|| service.stats().queued == queued).await;
    }

    blocker.await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first\n", "second\n", "third\n"]
    );
}

#[tokio::test]
async fn test_queue_timeout_never_runs() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);

    let blocker = spawn_execute(&service, "sleep:1000");
    wait_until(|| backend.running() == 1).await;

    let started = Instant::now();
    let response = service
        .execute(
            ExecutionRequest::new("out:never")
                .with_limits(LimitOverrides::default().with_wall_clock(Duration::from_millis(200))),
        )
        .await;

    assert_eq!(response.status, SessionState::Rejected);
    assert_eq!(response.failure, Some(FailureKind::Unavailable));
    assert_eq!(response.exit_code, -1);
    assert!(response.stdout.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(backend.provision_calls(), 1);

    blocker.await.unwrap();
}

#[tokio::test]
async fn test_unsupported_language_allocates_nothing() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 2);

    let response = service
        .execute(ExecutionRequest::new("print('hi')").with_lang("cobol-legacy"))
        .await;

    assert_eq!(response.status, SessionState::Rejected);
    assert_eq!(response.failure, Some(FailureKind::InvalidRequest));
    assert_eq!(response.exit_code, -1);
    assert!(response.message.unwrap().contains("cobol-legacy"));
    assert_eq!(backend.provision_calls(), 0);
    assert_eq!(service.stats().active, 0);
}

#[tokio::test]
async fn test_wall_clock_timeout_keeps_partial_output() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);

    let response = service
        .execute(
            ExecutionRequest::new("out:before\nhang")
                .with_limits(LimitOverrides::default().with_wall_clock(Duration::from_millis(300))),
        )
        .await;

    assert_eq!(response.status, SessionState::TimedOut);
    assert!(response.timed_out);
    assert_eq!(response.exit_code, 124);
    assert_eq!(response.stdout, "before\n");
    assert_eq!(backend.live_handles(), 0);
}

#[tokio::test]
async fn test_signal_is_a_crash() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);

    let response = service
        .execute(ExecutionRequest::new("out:x\nsignal:11"))
        .await;

    assert_eq!(response.status, SessionState::Crashed);
    assert_eq!(response.exit_code, 139);
    assert_eq!(response.stdout, "x\n");
    assert_eq!(response.failure, None);
}

#[tokio::test]
async fn test_output_truncation() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);

    let response = service
        .execute(
            ExecutionRequest::new("bytes:5000")
                .with_limits(LimitOverrides::default().with_max_output_bytes(1000)),
        )
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert!(response.truncated);
    assert_eq!(response.stdout, "x".repeat(1000));
}

#[tokio::test]
async fn test_dispose_once_per_handle() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 3);

    let scripts = ["out:ok", "exit:3", "signal:9", "hang"];
    let mut tasks = Vec::new();
    for script in scripts {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .execute(
                    ExecutionRequest::new(script).with_limits(
                        LimitOverrides::default().with_wall_clock(Duration::from_millis(300)),
                    ),
                )
                .await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert!(response.status.is_terminal());
    }

    let disposals = backend.disposals();
    assert_eq!(disposals.len(), scripts.len());
    assert!(disposals.values().all(|count| *count == 1));
    assert_eq!(backend.live_handles(), 0);
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 1);
    let cancel = CancellationToken::new();

    let task = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            service
                .execute_with_id(SessionId::new(), ExecutionRequest::new("hang"), cancel)
                .await
        })
    };
    wait_until(|| backend.running() == 1).await;
    cancel.cancel();

    let response = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancelled session must finish")
        .unwrap();
    assert_eq!(response.status, SessionState::Crashed);
    assert_eq!(response.exit_code, -1);
    assert_eq!(backend.live_handles(), 0);
    assert_eq!(service.stats().active, 0);
}

#[tokio::test]
async fn test_provision_failure_is_rejected() {
    let backend = ScriptedBackend::new().fail_provisioning(ProvisionError::ImageFetch {
        image: "python:3.12-slim".into(),
        reason: "registry unreachable".into(),
    });
    let service = scripted_service(&backend, 1);

    let response = service.execute(ExecutionRequest::new("out:hi")).await;
    assert_eq!(response.status, SessionState::Rejected);
    assert_eq!(response.failure, Some(FailureKind::Internal));
    assert!(response.message.unwrap().contains("registry unreachable"));
    assert_eq!(service.stats().active, 0);
}

#[tokio::test]
async fn test_persistent_session_lifecycle() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 2);

    let info = service
        .create_session("python", false, &LimitOverrides::default())
        .await
        .unwrap();
    assert_eq!(service.stats().active, 1);

    // max_sessions is 1 in the shared test config
    assert_matches!(
        service
            .create_session("python", false, &LimitOverrides::default())
            .await,
        Err(SessionError::LimitReached(1))
    );

    let first = service
        .execute_in_session(info.id, "out:one", &["requests".to_string()])
        .await
        .unwrap();
    assert_eq!(first.stdout, "one\n");
    let second = service
        .execute_in_session(info.id, "out:two", &[])
        .await
        .unwrap();
    assert_eq!(second.stdout, "two\n");

    let listed = service.list_sessions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].executions, 2);
    assert_eq!(listed[0].libraries, vec!["requests".to_string()]);
    assert_eq!(backend.provision_calls(), 1);

    assert!(service.close_session(info.id).await);
    assert!(!service.close_session(info.id).await);
    assert_matches!(
        service.execute_in_session(info.id, "out:x", &[]).await,
        Err(SessionError::NotFound(_))
    );
    assert_eq!(backend.live_handles(), 0);
    assert_eq!(service.stats().active, 0);
}

#[tokio::test]
async fn test_abandoned_session_execute_frees_the_session() {
    let backend = ScriptedBackend::new();
    let service = scripted_service(&backend, 2);

    let info = service
        .create_session("python", false, &LimitOverrides::default())
        .await
        .unwrap();
    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_in_session(info.id, "hang", &[]).await })
    };
    wait_until(|| backend.running() == 1).await;

    // A disconnected client drops the execute future
    running.abort();
    let _ = running.await;
    wait_until(|| backend.live_handles() == 0).await;

    assert!(service.list_sessions().is_empty());
    assert_eq!(service.stats().active, 0);
    let again = service
        .create_session("python", false, &LimitOverrides::default())
        .await;
    assert!(again.is_ok());
}
