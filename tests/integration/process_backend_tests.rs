//! End-to-end runs through the process backend
//!
//! Shell scenarios always run; Python scenarios are skipped when `python3`
//! is not installed.

use codebox_sandbox::{ExecutionRequest, LimitOverrides, SessionState};
use codebox_tests::common::{has_command, process_service, setup_test_logging};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_shell_hello() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 2);

    let response = service
        .execute(ExecutionRequest::new("echo hi").with_lang("sh"))
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert_eq!(response.stdout, "hi\n");
    assert_eq!(response.exit_code, 0);
    assert!(response.message.is_none());
}

#[tokio::test]
async fn test_shell_exit_code_and_stderr() {
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 2);

    let response = service
        .execute(ExecutionRequest::new("echo out; echo err >&2; exit 7").with_lang("bash"))
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert_eq!(response.stdout, "out\n");
    assert_eq!(response.stderr, "err\n");
    assert_eq!(response.exit_code, 7);
    assert_eq!(
        response.message.as_deref(),
        Some("Process exited with code 7")
    );
}

#[tokio::test]
async fn test_shell_busy_loop_times_out() {
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 1);

    let started = Instant::now();
    let response = service
        .execute(
            ExecutionRequest::new("echo started; while :; do :; done")
                .with_lang("sh")
                .with_limits(LimitOverrides::default().with_wall_clock(Duration::from_secs(1))),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status, SessionState::TimedOut);
    assert!(response.timed_out);
    assert_eq!(response.exit_code, 124);
    assert_eq!(response.stdout, "started\n");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_cpu_limit_times_out() {
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 1);

    let response = service
        .execute(
            ExecutionRequest::new("while :; do :; done")
                .with_lang("sh")
                .with_limits(LimitOverrides {
                    cpu_seconds: Some(1),
                    wall_clock: Some(Duration::from_secs(20)),
                    ..Default::default()
                }),
        )
        .await;

    assert_eq!(response.status, SessionState::TimedOut);
    assert!(response.timed_out);
    assert!(response.duration_ms < 20_000);
}

#[tokio::test]
async fn test_output_is_truncated() {
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 1);

    let response = service
        .execute(
            ExecutionRequest::new("i=0; while [ $i -lt 2000 ]; do echo line; i=$((i+1)); done")
                .with_lang("sh")
                .with_limits(LimitOverrides::default().with_max_output_bytes(100)),
        )
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert!(response.truncated);
    assert_eq!(response.stdout.len(), 100);
    assert!("line\n".repeat(20).starts_with(&response.stdout));
}

#[tokio::test]
async fn test_shell_session_keeps_workspace() {
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 2);

    let info = service
        .create_session("sh", false, &LimitOverrides::default())
        .await
        .unwrap();
    let first = service
        .execute_in_session(info.id, "echo kept > state.txt", &[])
        .await
        .unwrap();
    assert_eq!(first.status, SessionState::Completed);

    let second = service
        .execute_in_session(info.id, "cat state.txt", &[])
        .await
        .unwrap();
    assert_eq!(second.stdout, "kept\n");

    assert!(service.close_session(info.id).await);
    service.shutdown().await;
}

#[tokio::test]
async fn test_python_hello() {
    if !has_command("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 2);

    let response = service
        .execute(ExecutionRequest::new("print('hi')").with_lang("python"))
        .await;

    assert_eq!(response.status, SessionState::Completed);
    assert!(response.stdout.contains("hi"));
    assert_eq!(response.exit_code, 0);
}

#[tokio::test]
async fn test_python_infinite_loop_times_out() {
    if !has_command("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let service = process_service(root.path(), 1);

    let started = Instant::now();
    let response = service
        .execute(
            ExecutionRequest::new("while True: pass")
                .with_lang("python")
                .with_limits(LimitOverrides::default().with_wall_clock(Duration::from_secs(2))),
        )
        .await;

    assert_eq!(response.status, SessionState::TimedOut);
    assert!(response.timed_out);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(10));
}
