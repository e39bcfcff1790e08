//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler waits for running commands, abandons
//! pending retries and releases its lock file when it stops.

use crate::common::{RecordingHandler, utc, wait_for_outcome};
use harvest::scheduler::{SchedulerError, SchedulerState};
use harvest::testing::{ScriptedRunner, TestHarness, wait_until};
use harvest::{
    Event, EventBus, Job, JobCommand, RetryPolicy, RunOnceOptions, RunStatus, Schedule, Storage,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Test: shutdown waits for an in-flight command to finish.
#[tokio::test]
async fn test_shutdown_waits_for_running_job() {
    let harness = TestHarness::new(
        utc(2024, 6, 1, 1, 0),
        ScriptedRunner::new().with_delay(Duration::from_millis(300)),
    );
    let job = Job::shell("slow", "sleep 1", Schedule::daily("01:00").unwrap())
        .with_next_run_at(utc(2024, 6, 1, 1, 0));
    harness.manager().add(job).await.unwrap();

    let (handle, task) = harness.scheduler().start().await.unwrap();
    let runner = &harness.runner;
    assert!(wait_until(WAIT, || async { runner.active() == 1 }).await);

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.state().await, SchedulerState::Stopped);
    let job = wait_for_outcome(harness.storage.as_ref(), "slow", Duration::from_millis(10)).await;
    assert_eq!(job.last_status, Some(RunStatus::Succeeded));
}

/// Test: shutdown abandons a retry backoff and keeps the one-time job for the
/// next start.
#[tokio::test]
async fn test_shutdown_abandons_pending_retry() {
    let harness = TestHarness::new(
        utc(2024, 6, 1, 1, 0),
        ScriptedRunner::new().with_default_exit(1),
    );
    let handler = RecordingHandler::new();
    let bus = EventBus::new();
    bus.register(handler.clone()).await;

    let job = harness
        .manager()
        .run_once(
            JobCommand::shell("flaky"),
            None,
            RunOnceOptions {
                max_retries: Some(3),
                ..RunOnceOptions::default()
            },
        )
        .await
        .unwrap();

    let (handle, task) = harness
        .scheduler()
        .with_event_bus(bus)
        .with_retry_defaults(RetryPolicy::fixed(0, Duration::from_secs(60)))
        .start()
        .await
        .unwrap();

    let h = &handler;
    assert!(
        wait_until(WAIT, || async {
            h.count(|e| matches!(e, Event::RetryScheduled { .. })).await == 1
        })
        .await
    );

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(harness.runner.call_count(), 1);
    assert_eq!(
        handler
            .count(|e| matches!(e, Event::JobAbandoned { .. }))
            .await,
        1
    );

    let stored = harness.storage.get_job(&job.name).await.unwrap();
    assert_eq!(stored.last_status, Some(RunStatus::Interrupted));
    assert_eq!(stored.next_run_at, job.next_run_at);

    let runs = harness
        .storage
        .list_runs(Some(&job.name), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Interrupted);
    assert_eq!(runs[0].attempts, 1);
}

/// Test: the lock file holds our PID while running, blocks a second
/// scheduler and is removed on shutdown.
#[tokio::test]
async fn test_lock_file_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("run").join("harvest.pid");
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());

    let (handle, task) = harness
        .scheduler()
        .with_lock_file(&lock_path)
        .start()
        .await
        .unwrap();

    let pid = harvest::scheduler::lock::read_pid(&lock_path).unwrap();
    assert_eq!(pid, Some(std::process::id()));

    let second = harness.scheduler().with_lock_file(&lock_path).start().await;
    assert!(matches!(second, Err(SchedulerError::Lock(_))));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(!lock_path.exists());

    // The lock is free again.
    let (handle, task) = harness
        .scheduler()
        .with_lock_file(&lock_path)
        .start()
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: commands sent after shutdown fail instead of hanging.
#[tokio::test]
async fn test_handle_after_shutdown() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let (handle, task) = harness.scheduler().start().await.unwrap();

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(!handle.is_running().await);
    assert!(handle.status().await.is_err());
}
