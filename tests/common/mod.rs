//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harvest::testing::wait_until;
use harvest::{Event, EventHandler, Job, JobName, Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A UTC timestamp.
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .unwrap()
}

/// Event handler that keeps every event it sees.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Wait until `name` has a recorded outcome, polling storage.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_outcome(storage: &dyn Storage, name: &str, timeout: Duration) -> Job {
    let name = &JobName::new(name);
    let settled = wait_until(timeout, move || async move {
        matches!(storage.get_job(name).await, Ok(job) if job.last_status.is_some())
    })
    .await;
    assert!(settled, "timeout waiting for job '{}' to settle", name);
    storage.get_job(&name).await.unwrap()
}

/// Wait until `name` is no longer stored.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_removal(storage: &dyn Storage, name: &JobName, timeout: Duration) {
    let removed = wait_until(timeout, move || async move {
        matches!(storage.get_job(name).await, Err(StorageError::NotFound(_)))
    })
    .await;
    assert!(removed, "timeout waiting for job '{}' to be removed", name);
}
