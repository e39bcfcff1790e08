//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use super::lock::LockError;
use crate::core::job::JobError;
use crate::core::schedule::ScheduleError;
use crate::core::types::JobName;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job definition failed validation.
    #[error("invalid job: {0}")]
    InvalidJob(#[from] JobError),

    /// A job with this name already exists.
    #[error("job already exists: {0}")]
    DuplicateJob(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The lock file could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// No scheduler is running.
    #[error("scheduler is not running")]
    NotRunning,
}

impl From<ScheduleError> for SchedulerError {
    fn from(err: ScheduleError) -> Self {
        SchedulerError::InvalidJob(JobError::InvalidSchedule(err))
    }
}

impl SchedulerError {
    /// Turn a storage `NotFound` for `name` into `JobNotFound`.
    pub(crate) fn for_job(err: StorageError, name: &JobName) -> Self {
        match err {
            StorageError::NotFound(_) => SchedulerError::JobNotFound(name.to_string()),
            StorageError::DuplicateKey(_) => SchedulerError::DuplicateJob(name.to_string()),
            other => SchedulerError::Storage(other),
        }
    }

    /// Whether the error was caused by bad input rather than a fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidJob(_) | SchedulerError::DuplicateJob(_)
        )
    }
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Shutdown requested; waiting for in-flight runs.
    Stopping,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot reported by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Jobs currently executing or waiting out a retry backoff.
    pub running_jobs: Vec<JobName>,
    /// Worker pool size.
    pub workers: usize,
    /// Worker slots not held by an attempt.
    pub free_slots: usize,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run a tick now instead of waiting for the interval.
    Wake { response: oneshot::Sender<()> },
    /// Report the runtime state.
    Status {
        response: oneshot::Sender<SchedulerStatus>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
