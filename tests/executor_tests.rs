use std::path::Path;
use std::time::{Duration, Instant};

use herd::agent::JobExecutor;
use herd::protocol::EndStatus;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn run_sh(script: &str, workdir: &Path) -> herd::agent::executor::ExecutionResult {
    JobExecutor::new()
        .execute(
            Uuid::new_v4(),
            "/bin/sh",
            &sh(script),
            workdir,
            CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_execute_simple_command() {
    let dir = tempfile::tempdir().unwrap();
    let job_id = Uuid::new_v4();

    let result = JobExecutor::new()
        .execute(
            job_id,
            "/bin/sh",
            &sh("echo hello"),
            dir.path(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(result.job_id, job_id);
    assert_eq!(result.status, EndStatus::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, Some("hello\n".to_string()));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_empty_output() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_sh("true", dir.path()).await;

    assert_eq!(result.status, EndStatus::Completed);
    assert!(result.output.is_none()); // Empty output should be None
}

#[tokio::test]
async fn test_execute_large_output() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_sh("seq 1 1000", dir.path()).await;

    assert_eq!(result.status, EndStatus::Completed);
    assert_eq!(result.output.unwrap().lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_sh("exit 3", dir.path()).await;

    assert_eq!(result.status, EndStatus::Error);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_execute_failure_reports_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_sh("echo 'error message' >&2 && exit 1", dir.path()).await;

    assert_eq!(result.status, EndStatus::Error);
    assert!(result.error.unwrap().contains("error message"));
}

#[tokio::test]
async fn test_execute_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let result = JobExecutor::new()
        .execute(
            Uuid::new_v4(),
            "nonexistent_program_12345",
            &[],
            dir.path(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, EndStatus::Error);
    assert!(result.exit_code.is_none());
    assert!(result.error.unwrap().contains("nonexistent_program_12345"));
}

#[tokio::test]
async fn test_execute_runs_in_workdir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "from the job directory").unwrap();

    let result = run_sh("cat input.txt && echo done > out.txt", dir.path()).await;

    assert_eq!(result.status, EndStatus::Completed);
    assert_eq!(result.output, Some("from the job directory".to_string()));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "done\n"
    );
}

#[tokio::test]
async fn test_execute_with_env() {
    let dir = tempfile::tempdir().unwrap();
    let result = JobExecutor::new()
        .with_env("HERD_UNIT", "unit-7")
        .execute(
            Uuid::new_v4(),
            "/bin/sh",
            &sh("echo $HERD_UNIT"),
            dir.path(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(result.output, Some("unit-7\n".to_string()));
}

#[tokio::test]
async fn test_cancellation_kills_child() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let workdir = dir.path().to_path_buf();

    let started = Instant::now();
    let handle = tokio::spawn(async move {
        JobExecutor::new()
            .execute(Uuid::new_v4(), "/bin/sh", &sh("exec sleep 30"), &workdir, token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancelled job should return promptly")
        .unwrap();
    assert_eq!(result.status, EndStatus::Cancelled);
    assert!(result.error.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancel_before_start_still_reports_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = JobExecutor::new()
        .execute(Uuid::new_v4(), "/bin/sh", &sh("sleep 30"), dir.path(), cancel)
        .await;
    assert_eq!(result.status, EndStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_while_grandchild_holds_output() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let workdir = dir.path().to_path_buf();

    // The shell exits at once; the background sleep keeps stdout open.
    let handle = tokio::spawn(async move {
        JobExecutor::new()
            .execute(Uuid::new_v4(), "/bin/sh", &sh("sleep 5 & echo started"), &workdir, token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cancel should not wait for the grandchild")
        .unwrap();
    assert_eq!(result.status, EndStatus::Cancelled);
}
