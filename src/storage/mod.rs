//! Storage abstraction for persisting jobs and run history.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite, JSON file).
//!
//! Every method is a single atomic operation with respect to every other
//! method on the same backend. The targeted updates (`set_enabled`,
//! `record_outcome`, `update_next_run`) touch only the columns they name, so a
//! concurrent enable/disable never loses a scheduler-written `next_run_at` and
//! vice versa.

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use file::FileStorage;
pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::core::job::RunStatus;
use crate::core::job::Job;
use crate::core::types::{JobName, RunId};

/// Default number of run records kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// One dispatch of a job, covering all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    /// Unique run identifier.
    pub id: RunId,
    /// Job that was dispatched.
    pub job_name: JobName,
    /// Resolved command line.
    pub command: String,
    /// Run status.
    pub status: RunStatus,
    /// When the run was dispatched.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Exit code of the last attempt.
    pub exit_code: Option<i32>,
    /// Error message (if failed or interrupted).
    pub error: Option<String>,
    /// Tail of the last attempt's stdout.
    #[serde(default)]
    pub stdout: Option<String>,
    /// Tail of the last attempt's stderr.
    #[serde(default)]
    pub stderr: Option<String>,
}

impl StoredRun {
    /// Create a run record in the `running` state.
    pub fn new(
        id: RunId,
        job_name: JobName,
        command: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_name,
            command: command.into(),
            status: RunStatus::Running,
            started_at,
            ended_at: None,
            attempts: 0,
            exit_code: None,
            error: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Mark the run as succeeded.
    pub fn mark_succeeded(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Succeeded;
        self.ended_at = Some(at);
        self.error = None;
    }

    /// Mark the run as failed.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.ended_at = Some(at);
        self.error = Some(error.into());
    }

    /// Mark the run as interrupted.
    pub fn mark_interrupted(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.status = RunStatus::Interrupted;
        self.ended_at = Some(at);
        self.error = Some(reason.into());
    }

    /// Elapsed time, if the run has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Storage trait for persisting scheduler state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert a new job. Fails with `DuplicateKey` if the name exists.
    async fn insert_job(&self, job: Job) -> Result<(), StorageError>;

    /// Get a job by name.
    async fn get_job(&self, name: &JobName) -> Result<Job, StorageError>;

    /// List all jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// Delete a job by name.
    async fn delete_job(&self, name: &JobName) -> Result<(), StorageError>;

    /// Enable or disable a job.
    ///
    /// When enabling and the stored `next_run_at` is missing or earlier than
    /// `now`, it is replaced by `lapsed_next` (if given). Disabling keeps
    /// `next_run_at` untouched.
    async fn set_enabled(
        &self,
        name: &JobName,
        enabled: bool,
        lapsed_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Record the terminal outcome of a run and the next fire time.
    async fn record_outcome(
        &self,
        name: &JobName,
        last_run_at: DateTime<Utc>,
        last_status: RunStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Overwrite only `next_run_at`.
    async fn update_next_run(
        &self,
        name: &JobName,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Enabled jobs with `next_run_at <= now`, earliest first.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError>;

    // Run operations

    /// Save a new run record.
    async fn save_run(&self, run: StoredRun) -> Result<(), StorageError>;

    /// Get a run by ID.
    async fn get_run(&self, id: &RunId) -> Result<StoredRun, StorageError>;

    /// List runs, newest first, optionally for one job.
    /// Returns at most `limit` runs.
    async fn list_runs(
        &self,
        job: Option<&JobName>,
        limit: usize,
    ) -> Result<Vec<StoredRun>, StorageError>;

    /// Replace a run record.
    async fn update_run(&self, run: StoredRun) -> Result<(), StorageError>;

    /// Get all runs still in the `running` state.
    async fn get_incomplete_runs(&self) -> Result<Vec<StoredRun>, StorageError>;

    /// Mark a run as interrupted.
    async fn mark_run_interrupted(
        &self,
        id: &RunId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Delete the oldest runs so that at most `keep` remain.
    /// Returns the number of deleted runs.
    async fn prune_runs(&self, keep: usize) -> Result<usize, StorageError>;
}

/// Whether an enable should replace the stored next fire time.
pub(crate) fn next_run_lapsed(next_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    next_run_at.is_none_or(|next| next < now)
}
