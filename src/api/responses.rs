//! API response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::job::JobSummary;
use crate::scheduler::{SchedulerState, SchedulerStatus};
use crate::storage::{RunStatus, StoredRun};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Scheduler status response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerStatusResponse {
    pub state: SchedulerState,
    pub is_running: bool,
    pub running_jobs: Vec<String>,
    pub workers: usize,
    pub free_slots: usize,
}

impl From<SchedulerStatus> for SchedulerStatusResponse {
    fn from(status: SchedulerStatus) -> Self {
        Self {
            is_running: status.state == SchedulerState::Running,
            state: status.state,
            running_jobs: status.running_jobs.iter().map(|j| j.to_string()).collect(),
            workers: status.workers,
            free_slots: status.free_slots,
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub count: usize,
}

/// Response to queuing a one-time job.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunOnceResponse {
    pub job: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub message: String,
}

/// One entry of a job's run history.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub id: String,
    pub job: String,
    pub command: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl From<StoredRun> for RunResponse {
    fn from(run: StoredRun) -> Self {
        Self {
            id: run.id.to_string(),
            job: run.job_name.to_string(),
            duration_ms: run.duration().map(|d| d.num_milliseconds()),
            command: run.command,
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            attempts: run.attempts,
            exit_code: run.exit_code,
            error: run.error,
        }
    }
}

/// List of runs response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunResponse>,
    pub count: usize,
}

/// Simple message response.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}
