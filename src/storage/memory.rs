//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{RunStatus, Storage, StorageError, StoredRun, next_run_lapsed};
use crate::core::job::Job;
use crate::core::types::{JobName, RunId};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    jobs: RwLock<HashMap<JobName, Job>>,
    runs: RwLock<HashMap<RunId, StoredRun>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn job_not_found(name: &JobName) -> StorageError {
    StorageError::NotFound(format!("job: {}", name))
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.name) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.name)));
        }
        jobs.insert(job.name.clone(), job);
        Ok(())
    }

    async fn get_job(&self, name: &JobName) -> Result<Job, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(name).cloned().ok_or_else(|| job_not_found(name))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(result)
    }

    async fn delete_job(&self, name: &JobName) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        jobs.remove(name).ok_or_else(|| job_not_found(name))?;
        Ok(())
    }

    async fn set_enabled(
        &self,
        name: &JobName,
        enabled: bool,
        lapsed_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs.get_mut(name).ok_or_else(|| job_not_found(name))?;
        job.enabled = enabled;
        job.updated_at = now;
        if enabled && lapsed_next.is_some() && next_run_lapsed(job.next_run_at, now) {
            job.next_run_at = lapsed_next;
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        name: &JobName,
        last_run_at: DateTime<Utc>,
        last_status: RunStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs.get_mut(name).ok_or_else(|| job_not_found(name))?;
        job.last_run_at = Some(last_run_at);
        job.last_status = Some(last_status);
        job.next_run_at = next_run_at;
        Ok(())
    }

    async fn update_next_run(
        &self,
        name: &JobName,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs.get_mut(name).ok_or_else(|| job_not_found(name))?;
        job.next_run_at = next_run_at;
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|job| job.enabled && job.next_run_at.is_some_and(|next| next <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(due)
    }

    async fn save_run(&self, run: StoredRun) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if runs.contains_key(&run.id) {
            return Err(StorageError::DuplicateKey(format!("run: {}", run.id)));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<StoredRun, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        runs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))
    }

    async fn list_runs(
        &self,
        job: Option<&JobName>,
        limit: usize,
    ) -> Result<Vec<StoredRun>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| job.is_none_or(|name| &r.job_name == name))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn update_run(&self, run: StoredRun) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if !runs.contains_key(&run.id) {
            return Err(StorageError::NotFound(format!("run: {}", run.id)));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_incomplete_runs(&self) -> Result<Vec<StoredRun>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect())
    }

    async fn mark_run_interrupted(
        &self,
        id: &RunId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let run = runs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))?;
        run.mark_interrupted(at, "scheduler stopped before the run finished");
        Ok(())
    }

    async fn prune_runs(&self, keep: usize) -> Result<usize, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if runs.len() <= keep {
            return Ok(0);
        }
        let mut by_age: Vec<(DateTime<Utc>, RunId)> = runs
            .values()
            .map(|r| (r.started_at, r.id.clone()))
            .collect();
        by_age.sort_by(|a, b| a.0.cmp(&b.0));
        let excess = runs.len() - keep;
        for (_, id) in by_age.into_iter().take(excess) {
            runs.remove(&id);
        }
        Ok(excess)
    }
}
