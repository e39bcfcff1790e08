//! API integration tests.
//!
//! These tests drive the control API router directly with `oneshot` requests
//! against a scheduler running on in-memory storage.

use crate::common::{utc, wait_for_removal};
use harvest::api::{ApiState, build_router, create_api_state};
use harvest::core::job::DEFAULT_TIMEOUT;
use harvest::testing::{ScriptedRunner, TestHarness};
use harvest::{InMemoryStorage, Job, JobName, Schedule, SchedulerHandle, SchedulerState, Storage};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// A running scheduler and the API state wired to it.
async fn create_test_state(
    harness: &TestHarness,
) -> (ApiState<InMemoryStorage>, SchedulerHandle, JoinHandle<()>) {
    let (handle, task) = harness.scheduler().start().await.unwrap();
    let state = create_api_state(harness.manager(), Some(handle.clone()), DEFAULT_TIMEOUT);
    (state, handle, task)
}

fn harness() -> TestHarness {
    TestHarness::new(utc(2024, 6, 1, 1, 0), ScriptedRunner::new())
}

async fn send(
    state: &ApiState<InMemoryStorage>,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let harness = harness();
    let (state, handle, _task) = create_test_state(&harness).await;

    let (status, json) = send(&state, "GET", "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());

    handle.shutdown().await.unwrap();
}

/// Test: Scheduler status reports the running state and pool size.
#[tokio::test]
async fn test_scheduler_status_endpoint() {
    let harness = harness();
    let (state, handle, _task) = create_test_state(&harness).await;

    let (status, json) = send(&state, "GET", "/api/scheduler/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);
    assert_eq!(json["workers"], 5);
    assert_eq!(json["free_slots"], 5);
    assert_eq!(json["running_jobs"], json!([]));

    handle.shutdown().await.unwrap();
}

/// Test: Without a scheduler, control endpoints report unavailable while the
/// job table still works.
#[tokio::test]
async fn test_status_without_scheduler() {
    let harness = harness();
    let state = create_api_state(harness.manager(), None, DEFAULT_TIMEOUT);

    let (status, json) = send(&state, "GET", "/api/scheduler/status", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "SERVICE_UNAVAILABLE");

    let (status, json) = send(&state, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);
}

/// Test: Jobs can be created, listed, fetched and deleted.
#[tokio::test]
async fn test_job_crud() {
    let harness = harness();
    let (state, handle, _task) = create_test_state(&harness).await;

    let body = json!({
        "name": "nightly",
        "command": "echo hi",
        "schedule": {"type": "daily", "time": "03:00"},
        "max_retries": 2
    });
    let (status, json) = send(&state, "POST", "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["name"], "nightly");
    assert_eq!(json["max_retries"], 2);
    assert_eq!(json["next_run_at"], "2024-06-01T03:00:00Z");

    let (status, json) = send(&state, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["jobs"][0]["name"], "nightly");
    assert_eq!(json["jobs"][0]["enabled"], true);

    let (status, json) = send(&state, "GET", "/api/jobs/nightly", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["command"]["command"], "echo hi");

    let (status, _) = send(&state, "DELETE", "/api/jobs/nightly", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&state, "GET", "/api/jobs/nightly", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    handle.shutdown().await.unwrap();
}

/// Test: Creating a duplicate job conflicts; a bad schedule is rejected.
#[tokio::test]
async fn test_create_job_errors() {
    let harness = harness();
    let (state, handle, _task) = create_test_state(&harness).await;

    let body = json!({
        "name": "nightly",
        "command": "echo hi",
        "schedule": {"type": "daily", "time": "03:00"}
    });
    let (status, _) = send(&state, "POST", "/api/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(&state, "POST", "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");

    let bad = json!({
        "name": "broken",
        "command": "echo hi",
        "schedule": {"type": "daily", "time": "25:00"}
    });
    let (status, json) = send(&state, "POST", "/api/jobs", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let unknown_type = json!({
        "name": "typed",
        "job_type": "nope",
        "schedule": {"type": "interval", "minutes": 5}
    });
    let (status, _) = send(&state, "POST", "/api/jobs", Some(unknown_type)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let huge_interval = json!({
        "name": "huge",
        "command": "echo hi",
        "schedule": {"type": "interval", "hours": u64::MAX / 1000}
    });
    let (status, _) = send(&state, "POST", "/api/jobs", Some(huge_interval)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(harness.storage.list_jobs().await.unwrap().len(), 1);

    handle.shutdown().await.unwrap();
}

/// Test: Disable and enable toggle the stored flag.
#[tokio::test]
async fn test_enable_disable_endpoints() {
    let harness = harness();
    harness
        .manager()
        .add(Job::shell("nightly", "echo", Schedule::daily("03:00").unwrap()))
        .await
        .unwrap();
    let (state, handle, _task) = create_test_state(&harness).await;

    let (status, json) = send(&state, "POST", "/api/jobs/nightly/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "job 'nightly' disabled");
    let job = harness.storage.get_job(&JobName::new("nightly")).await.unwrap();
    assert!(!job.enabled);

    let (status, _) = send(&state, "POST", "/api/jobs/nightly/enable", None).await;
    assert_eq!(status, StatusCode::OK);
    let job = harness.storage.get_job(&JobName::new("nightly")).await.unwrap();
    assert!(job.enabled);

    let (status, _) = send(&state, "POST", "/api/jobs/missing/enable", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    handle.shutdown().await.unwrap();
}

/// Test: run-once queues a job that the scheduler runs and removes, and its
/// history stays readable through storage.
#[tokio::test]
async fn test_run_once_endpoint() {
    let harness = harness();
    let (state, handle, _task) = create_test_state(&harness).await;

    let (status, json) = send(
        &state,
        "POST",
        "/api/run-once",
        Some(json!({"command": "echo once"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let name = json["job"].as_str().unwrap().to_string();
    assert!(name.starts_with("onetime_shell_20240601_010000_"));

    let name = JobName::new(name);
    wait_for_removal(harness.storage.as_ref(), &name, Duration::from_secs(5)).await;
    assert_eq!(harness.runner.commands(), vec!["echo once".to_string()]);

    let runs = harness.storage.list_runs(Some(&name), 10).await.unwrap();
    assert_eq!(runs.len(), 1);

    let (status, _) = send(&state, "POST", "/api/run-once", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    handle.shutdown().await.unwrap();
}

/// Test: Run history lists runs newest first.
#[tokio::test]
async fn test_list_runs_endpoint() {
    let harness = harness();
    let job = Job::shell("frequent", "echo", Schedule::every(Duration::from_secs(60)).unwrap())
        .with_next_run_at(utc(2024, 6, 1, 1, 0));
    harness.manager().add(job).await.unwrap();
    let (state, handle, _task) = create_test_state(&harness).await;

    let storage = harness.storage.clone();
    assert!(
        harvest::testing::wait_until(Duration::from_secs(5), || async {
            storage
                .get_job(&JobName::new("frequent"))
                .await
                .is_ok_and(|j| j.last_status.is_some())
        })
        .await
    );

    let (status, json) = send(&state, "GET", "/api/jobs/frequent/runs?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["runs"][0]["job"], "frequent");
    assert_eq!(json["runs"][0]["status"], "succeeded");
    assert_eq!(json["runs"][0]["attempts"], 1);

    let (status, _) = send(&state, "GET", "/api/jobs/missing/runs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    handle.shutdown().await.unwrap();
}

/// Test: The shutdown endpoint stops the scheduler.
#[tokio::test]
async fn test_shutdown_endpoint() {
    let harness = harness();
    let (state, handle, task) = create_test_state(&harness).await;

    let (status, json) = send(&state, "POST", "/api/scheduler/shutdown", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "scheduler stopped");

    task.await.unwrap();
    assert_eq!(handle.state().await, SchedulerState::Stopped);
}
