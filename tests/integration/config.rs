//! Configuration integration tests.
//!
//! Tests that verify a YAML document on disk configures a scheduler: seed
//! schedules are imported on start without overwriting stored jobs.

use crate::common::utc;
use harvest::config::YamlLoader;
use harvest::testing::{ScriptedRunner, TestHarness};
use harvest::{JobCommand, JobName, Schedule, Storage};
use std::time::Duration;

const CONFIG: &str = r#"
scheduler:
  workers: 3
  timezone: UTC
default_timeout_secs: 600
job_types:
  transcripts: earnings-download-transcripts
schedules:
  - name: daily_transcripts
    job_type: transcripts
    schedule:
      type: daily
      time: "02:00"
    options:
      year: 2024
  - name: cleanup
    command: rm -rf /tmp/harvest-cache
    schedule:
      type: interval
      hours: 6
    max_retries: 1
"#;

/// Test: seed schedules from a config file land in the job table on start.
#[tokio::test]
async fn test_seed_schedules_imported_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvest.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = YamlLoader::load(&path).unwrap();
    assert_eq!(config.scheduler.workers, 3);

    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    let (handle, task) = harness
        .scheduler()
        .with_job_types(config.job_types.clone())
        .with_workers(config.scheduler.workers)
        .with_seed_jobs(config.seed_jobs().unwrap())
        .start()
        .await
        .unwrap();

    let transcripts = harness
        .storage
        .get_job(&JobName::new("daily_transcripts"))
        .await
        .unwrap();
    assert_eq!(transcripts.schedule, Schedule::daily("02:00").unwrap());
    assert_eq!(transcripts.timeout, Duration::from_secs(600));
    assert_eq!(transcripts.next_run_at, Some(utc(2024, 6, 1, 2, 0)));

    let cleanup = harness
        .storage
        .get_job(&JobName::new("cleanup"))
        .await
        .unwrap();
    assert_eq!(cleanup.command, JobCommand::shell("rm -rf /tmp/harvest-cache"));
    assert_eq!(cleanup.max_retries, Some(1));
    assert_eq!(cleanup.next_run_at, Some(utc(2024, 6, 1, 7, 0)));

    assert_eq!(handle.status().await.unwrap().workers, 3);
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: a stored job is kept as it is when the config seeds the same name.
#[tokio::test]
async fn test_seed_does_not_overwrite_stored_job() {
    let harness = TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new());
    harness
        .manager()
        .add(harvest::Job::shell(
            "cleanup",
            "echo customised",
            Schedule::daily("05:00").unwrap(),
        ))
        .await
        .unwrap();

    let config = YamlLoader::parse(CONFIG).unwrap();
    let (handle, task) = harness
        .scheduler()
        .with_job_types(config.job_types.clone())
        .with_seed_jobs(config.seed_jobs().unwrap())
        .start()
        .await
        .unwrap();

    let cleanup = harness
        .storage
        .get_job(&JobName::new("cleanup"))
        .await
        .unwrap();
    assert_eq!(cleanup.command, JobCommand::shell("echo customised"));
    assert_eq!(harness.storage.list_jobs().await.unwrap().len(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: `init` writes a document that loads back with the seed job.
#[test]
fn test_init_writes_loadable_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("harvest.yaml");

    let written = YamlLoader::init(&path, false).unwrap();
    let loaded = YamlLoader::load(&path).unwrap();
    assert_eq!(written, loaded);
    assert_eq!(loaded.schedules.len(), 1);
    assert_eq!(loaded.schedules[0].name, "daily_transcripts");

    assert!(YamlLoader::init(&path, false).is_err());
    assert!(YamlLoader::init(&path, true).is_ok());
}
