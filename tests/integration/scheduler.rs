//! Scheduling scenarios driven by a manual clock.
//!
//! These tests start a real scheduler loop against in-memory storage and a
//! scripted command runner, then move the clock to make jobs due.

use crate::common::{RecordingHandler, utc, wait_for_outcome, wait_for_removal};
use harvest::scheduler::SchedulerError;
use harvest::testing::{ScriptedRunner, TestHarness, wait_until};
use harvest::{
    Event, EventBus, Job, JobCommand, JobName, RetryPolicy, RunOnceOptions, RunStatus, Schedule,
    Storage,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Test: a daily 02:00 job added at 01:00 fires when the clock reaches 02:00
/// and is rescheduled for the next day.
#[tokio::test]
async fn test_daily_job_fires_at_scheduled_time() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let job = harness
        .manager()
        .add(Job::shell("daily_x", "echo hi", Schedule::daily("02:00").unwrap()))
        .await
        .unwrap();
    assert_eq!(job.next_run_at, Some(utc(2024, 6, 1, 2, 0)));

    let (handle, task) = harness.scheduler().start().await.unwrap();

    // Nothing is due yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.runner.call_count(), 0);

    harness.clock.set(utc(2024, 6, 1, 2, 0));
    let job = wait_for_outcome(harness.storage.as_ref(), "daily_x", WAIT).await;

    assert_eq!(harness.runner.commands(), vec!["echo hi".to_string()]);
    assert_eq!(job.last_status, Some(RunStatus::Succeeded));
    assert_eq!(job.last_run_at, Some(utc(2024, 6, 1, 2, 0)));
    assert_eq!(job.next_run_at, Some(utc(2024, 6, 2, 2, 0)));

    let runs = harness
        .storage
        .list_runs(Some(&JobName::new("daily_x")), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);
    assert_eq!(runs[0].attempts, 1);
    assert_eq!(runs[0].exit_code, Some(0));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: a failing one-time job with two retries runs three times, is
/// recorded as failed and then removed from the job table.
#[tokio::test]
async fn test_run_once_failing_command_retries_then_is_removed() {
    let harness = TestHarness::new(
        utc(2024, 6, 1, 1, 0),
        ScriptedRunner::new().with_default_exit(1),
    );
    let handler = RecordingHandler::new();
    let bus = EventBus::new();
    bus.register(handler.clone()).await;

    let options = RunOnceOptions {
        max_retries: Some(2),
        ..RunOnceOptions::default()
    };
    let job = harness
        .manager()
        .run_once(JobCommand::shell("false"), None, options)
        .await
        .unwrap();

    let (handle, task) = harness
        .scheduler()
        .with_event_bus(bus)
        .with_retry_defaults(RetryPolicy::fixed(0, Duration::from_millis(10)))
        .start()
        .await
        .unwrap();

    wait_for_removal(harness.storage.as_ref(), &job.name, WAIT).await;
    assert_eq!(harness.runner.call_count(), 3);

    let runs = harness
        .storage
        .list_runs(Some(&job.name), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].attempts, 3);
    assert_eq!(runs[0].exit_code, Some(1));

    assert_eq!(
        handler
            .count(|e| matches!(e, Event::AttemptFailed { .. }))
            .await,
        3
    );
    assert_eq!(
        handler
            .count(|e| matches!(e, Event::RetryScheduled { .. }))
            .await,
        2
    );
    assert_eq!(
        handler
            .count(|e| matches!(e, Event::JobRemoved { .. }))
            .await,
        1
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: a job that missed several occurrences while the scheduler was down
/// fires exactly once on start.
#[tokio::test]
async fn test_missed_occurrences_coalesce_into_one_run() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let job = Job::shell(
        "hourly",
        "sync",
        Schedule::every(Duration::from_secs(3600)).unwrap(),
    )
    .with_next_run_at(utc(2024, 5, 31, 20, 0));
    harness.manager().add(job).await.unwrap();

    let (handle, task) = harness.scheduler().start().await.unwrap();

    let job = wait_for_outcome(harness.storage.as_ref(), "hourly", WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.runner.call_count(), 1);
    assert_eq!(job.last_run_at, Some(utc(2024, 6, 1, 1, 0)));
    assert_eq!(job.next_run_at, Some(utc(2024, 6, 1, 2, 0)));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: the worker pool bounds how many commands run at once.
#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new().gated());
    let manager = harness.manager();
    for i in 0..5 {
        let job = Job::shell(
            format!("job_{}", i),
            format!("work {}", i),
            Schedule::daily("01:00").unwrap(),
        )
        .with_next_run_at(utc(2024, 6, 1, 1, 0));
        manager.add(job).await.unwrap();
    }

    let (handle, task) = harness.scheduler().with_workers(2).start().await.unwrap();

    let runner = &harness.runner;
    assert!(wait_until(WAIT, || async { runner.active() == 2 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.active(), 2);

    let status = handle.status().await.unwrap();
    assert_eq!(status.workers, 2);
    assert_eq!(status.free_slots, 0);
    assert_eq!(status.running_jobs.len(), 5);

    runner.release(5);
    for i in 0..5 {
        let job = wait_for_outcome(harness.storage.as_ref(), &format!("job_{}", i), WAIT).await;
        assert_eq!(job.last_status, Some(RunStatus::Succeeded));
    }
    assert_eq!(runner.call_count(), 5);
    assert_eq!(runner.max_concurrent(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: a failed run leaves the loop dispatching other jobs.
#[tokio::test]
async fn test_failure_is_isolated_to_its_job() {
    let harness = TestHarness::new(
        utc(2024, 6, 1, 1, 0),
        ScriptedRunner::new().then_exit(2),
    );
    let manager = harness.manager();
    let first = Job::shell("first", "fails", Schedule::daily("01:00").unwrap())
        .with_next_run_at(utc(2024, 6, 1, 1, 0));
    manager.add(first).await.unwrap();

    let (handle, task) = harness.scheduler().start().await.unwrap();
    let first = wait_for_outcome(harness.storage.as_ref(), "first", WAIT).await;
    assert_eq!(first.last_status, Some(RunStatus::Failed));

    let second = Job::shell("second", "works", Schedule::daily("01:00").unwrap())
        .with_next_run_at(utc(2024, 6, 1, 1, 0));
    manager.add(second).await.unwrap();
    let second = wait_for_outcome(harness.storage.as_ref(), "second", WAIT).await;
    assert_eq!(second.last_status, Some(RunStatus::Succeeded));

    // The failed job is rescheduled like any other.
    assert_eq!(first.next_run_at, Some(utc(2024, 6, 2, 1, 0)));
    assert_eq!(handle.state().await, harvest::SchedulerState::Running);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: disabled jobs are never dispatched, even when overdue.
#[tokio::test]
async fn test_disabled_job_is_skipped() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let job = Job::shell("paused", "echo", Schedule::daily("00:30").unwrap())
        .with_enabled(false)
        .with_next_run_at(utc(2024, 6, 1, 0, 30));
    harness.manager().add(job).await.unwrap();

    let (handle, task) = harness.scheduler().start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.runner.call_count(), 0);

    // Re-enabling replaces the lapsed fire time rather than catching up.
    harness
        .manager()
        .enable(&JobName::new("paused"))
        .await
        .unwrap();
    let job = harness
        .storage
        .get_job(&JobName::new("paused"))
        .await
        .unwrap();
    assert_eq!(job.next_run_at, Some(utc(2024, 6, 2, 0, 30)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.runner.call_count(), 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: adding a duplicate name fails and leaves the stored job untouched.
#[tokio::test]
async fn test_duplicate_add_keeps_existing_job() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let manager = harness.manager();
    manager
        .add(Job::shell("nightly", "original", Schedule::daily("03:00").unwrap()))
        .await
        .unwrap();

    let err = manager
        .add(Job::shell("nightly", "replacement", Schedule::daily("04:00").unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateJob(name) if name == "nightly"));

    let stored = manager.get(&JobName::new("nightly")).await.unwrap();
    assert_eq!(stored.command, JobCommand::shell("original"));
    assert_eq!(stored.next_run_at, Some(utc(2024, 6, 1, 3, 0)));
}

/// Test: "run now" through a manager attached to the scheduler starts the job
/// without waiting for the next tick.
#[tokio::test]
async fn test_run_once_wakes_scheduler() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let (handle, task) = harness
        .scheduler()
        .with_tick_interval(Duration::from_secs(3600))
        .start()
        .await
        .unwrap();

    let manager = harness.manager().with_handle(handle.clone());
    let job = manager
        .run_once(JobCommand::shell("echo now"), None, RunOnceOptions::default())
        .await
        .unwrap();

    wait_for_removal(harness.storage.as_ref(), &job.name, WAIT).await;
    assert_eq!(harness.runner.commands(), vec!["echo now".to_string()]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: typed jobs run the configured base command with rendered options.
#[tokio::test]
async fn test_typed_job_resolves_through_job_types() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let registry = harvest::JobTypeRegistry::new().with_type("sec", "earnings-download-sec");
    let mut options = std::collections::BTreeMap::new();
    options.insert("ticker".to_string(), serde_json::json!("AAPL"));

    let job = Job::new(
        "aapl_filings",
        JobCommand::typed("sec", options),
        Schedule::daily("01:00").unwrap(),
    )
    .with_next_run_at(utc(2024, 6, 1, 1, 0));
    harness
        .manager()
        .with_job_types(registry.clone())
        .add(job)
        .await
        .unwrap();

    let (handle, task) = harness
        .scheduler()
        .with_job_types(registry)
        .start()
        .await
        .unwrap();
    wait_for_outcome(harness.storage.as_ref(), "aapl_filings", WAIT).await;

    assert_eq!(
        harness.runner.commands(),
        vec!["earnings-download-sec --ticker AAPL".to_string()]
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
