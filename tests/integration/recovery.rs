//! Recovery integration tests.
//!
//! Tests that verify the job table and run history survive a restart, and
//! that a scheduler started after a crash marks leftover runs as interrupted
//! and fires overdue jobs once.

use crate::common::{utc, wait_for_outcome};
use harvest::testing::{ManualClock, ScriptedRunner};
use harvest::{
    FileStorage, Job, JobManager, JobName, RetryPolicy, RunId, RunStatus, Schedule, Scheduler,
    Storage, StoredRun,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Leave the store as a crashed process would: a job whose 02:00 run never
/// finished.
async fn seed_crashed_state(storage: &dyn Storage) -> RunId {
    let mut job = Job::shell("nightly", "backup", Schedule::daily("02:00").unwrap())
        .with_next_run_at(utc(2024, 6, 1, 2, 0));
    job.created_at = utc(2024, 5, 1, 0, 0);
    job.updated_at = utc(2024, 5, 1, 0, 0);
    storage.insert_job(job).await.unwrap();

    let run_id = RunId::new();
    let run = StoredRun::new(
        run_id.clone(),
        JobName::new("nightly"),
        "backup",
        utc(2024, 6, 1, 2, 0),
    );
    storage.save_run(run).await.unwrap();
    run_id
}

/// Restart at 03:00 and check the interrupted run and the catch-up run.
async fn assert_recovers<S: Storage + 'static>(storage: S, crashed_run: RunId) {
    let storage = Arc::new(storage);
    let runner = Arc::new(ScriptedRunner::new());
    let (handle, task) = Scheduler::with_storage(Arc::clone(&storage))
        .with_runner(runner.clone())
        .with_clock(Arc::new(ManualClock::new(utc(2024, 6, 1, 3, 0))))
        .with_retry_defaults(RetryPolicy::none())
        .with_tick_interval(Duration::from_millis(10))
        .start()
        .await
        .unwrap();

    let job = wait_for_outcome(storage.as_ref(), "nightly", WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(runner.call_count(), 1);
    assert_eq!(job.last_status, Some(RunStatus::Succeeded));
    assert_eq!(job.last_run_at, Some(utc(2024, 6, 1, 3, 0)));
    assert_eq!(job.next_run_at, Some(utc(2024, 6, 2, 2, 0)));

    let crashed = storage.get_run(&crashed_run).await.unwrap();
    assert_eq!(crashed.status, RunStatus::Interrupted);
    assert_eq!(crashed.ended_at, Some(utc(2024, 6, 1, 3, 0)));

    let runs = storage
        .list_runs(Some(&JobName::new("nightly")), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Succeeded);
    assert_eq!(runs[1].id, crashed_run);

    assert!(storage.get_incomplete_runs().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: JSON file storage keeps jobs across reopen.
#[tokio::test]
async fn test_file_storage_persists_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    let added = {
        let storage = Arc::new(FileStorage::open(&path).await.unwrap());
        let manager = JobManager::new(storage)
            .with_clock(Arc::new(ManualClock::new(utc(2024, 6, 1, 1, 0))));
        manager
            .add(
                Job::shell("weekly_report", "report", Schedule::weekly("monday", "08:00").unwrap())
                    .with_max_retries(1)
                    .with_description("weekly summary"),
            )
            .await
            .unwrap()
    };

    let reopened = FileStorage::open(&path).await.unwrap();
    let stored = reopened
        .get_job(&JobName::new("weekly_report"))
        .await
        .unwrap();
    assert_eq!(stored, added);
    assert_eq!(stored.next_run_at, Some(utc(2024, 6, 3, 8, 0)));
}

/// Test: a scheduler restarted on the same JSON file recovers the crashed run.
#[tokio::test]
async fn test_file_storage_crash_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    let crashed_run = {
        let storage = FileStorage::open(&path).await.unwrap();
        seed_crashed_state(&storage).await
    };

    let storage = FileStorage::open(&path).await.unwrap();
    assert_recovers(storage, crashed_run).await;
}

/// Test: a job added through a separate handle on the same JSON file (as the
/// CLI does) is picked up and run by a scheduler that is already running.
#[tokio::test]
async fn test_file_storage_job_added_by_second_handle_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    let storage = Arc::new(FileStorage::open(&path).await.unwrap());
    let runner = Arc::new(ScriptedRunner::new());
    let clock = Arc::new(ManualClock::new(utc(2024, 6, 1, 1, 0)));
    let (handle, task) = Scheduler::with_storage(Arc::clone(&storage))
        .with_runner(runner.clone())
        .with_clock(clock.clone())
        .with_retry_defaults(RetryPolicy::none())
        .with_tick_interval(Duration::from_millis(10))
        .start()
        .await
        .unwrap();

    let cli = JobManager::new(Arc::new(FileStorage::open(&path).await.unwrap()))
        .with_clock(clock.clone());
    cli.run_once(harvest::JobCommand::shell("echo from cli"), None, Default::default())
        .await
        .unwrap();

    assert!(
        harvest::testing::wait_until(WAIT, || async { runner.call_count() == 1 }).await
    );
    assert_eq!(runner.commands(), vec!["echo from cli".to_string()]);
    assert!(
        harvest::testing::wait_until(WAIT, || async {
            cli.list().await.is_ok_and(|jobs| jobs.is_empty())
        })
        .await
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: in-memory storage recovers a leftover run on start.
#[tokio::test]
async fn test_memory_storage_crash_recovery() {
    let storage = harvest::InMemoryStorage::new();
    let crashed_run = seed_crashed_state(&storage).await;
    assert_recovers(storage, crashed_run).await;
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use harvest::SqliteStorage;

    /// Test: SQLite storage keeps jobs across reopen.
    #[tokio::test]
    async fn test_sqlite_storage_persists_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.db");

        {
            let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
            let manager = JobManager::new(Arc::clone(&storage))
                .with_clock(Arc::new(ManualClock::new(utc(2024, 6, 1, 1, 0))));
            manager
                .add(Job::shell(
                    "hourly_sync",
                    "sync",
                    Schedule::every(Duration::from_secs(3600)).unwrap(),
                ))
                .await
                .unwrap();
            storage.close().await;
        }

        let reopened = SqliteStorage::new(&path).await.unwrap();
        let stored = reopened
            .get_job(&JobName::new("hourly_sync"))
            .await
            .unwrap();
        assert_eq!(stored.command, harvest::JobCommand::shell("sync"));
        assert_eq!(stored.next_run_at, Some(utc(2024, 6, 1, 2, 0)));
        assert!(stored.enabled);
    }

    /// Test: a scheduler restarted on the same database recovers the crashed run.
    #[tokio::test]
    async fn test_sqlite_storage_crash_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.db");

        let crashed_run = {
            let storage = SqliteStorage::new(&path).await.unwrap();
            let run = seed_crashed_state(&storage).await;
            storage.close().await;
            run
        };

        let storage = SqliteStorage::new(&path).await.unwrap();
        assert_recovers(storage, crashed_run).await;
    }
}
