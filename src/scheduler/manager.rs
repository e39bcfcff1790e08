//! Job table operations.
//!
//! `JobManager` validates and persists changes to the job table. It works
//! against storage directly, so it is usable whether or not a scheduler is
//! running in this process; the running scheduler picks changes up on its
//! next tick. When a [`SchedulerHandle`] is attached, "run now" one-time jobs
//! wake the loop immediately.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::handle::SchedulerHandle;
use super::types::SchedulerError;
use crate::core::clock::{Clock, SystemClock};
use crate::core::job::{DEFAULT_TIMEOUT, Job, JobCommand, JobSummary, JobTypeRegistry};
use crate::core::schedule::Schedule;
use crate::core::types::{JobName, RunId};
use crate::storage::{Storage, StorageError, StoredRun};

/// Per-job settings for a one-time job.
#[derive(Debug, Clone, Default)]
pub struct RunOnceOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub description: Option<String>,
}

/// Outcome of importing seed jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: Vec<JobName>,
    pub skipped: Vec<JobName>,
}

/// Validating front end to the job table.
pub struct JobManager<S: Storage> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    registry: JobTypeRegistry,
    interval_immediate: bool,
    default_timeout: Duration,
    handle: Option<SchedulerHandle>,
}

impl<S: Storage> JobManager<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            timezone: chrono_tz::UTC,
            registry: JobTypeRegistry::new(),
            interval_immediate: false,
            default_timeout: DEFAULT_TIMEOUT,
            handle: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    /// Job types that typed commands may reference.
    pub fn with_job_types(mut self, registry: JobTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Interval jobs fire on the next tick after being added.
    pub fn with_interval_immediate(mut self, immediate: bool) -> Self {
        self.interval_immediate = immediate;
        self
    }

    /// Timeout for one-time jobs that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Wake this scheduler when a job is queued to run now.
    pub fn with_handle(mut self, handle: SchedulerHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn job_types(&self) -> &JobTypeRegistry {
        &self.registry
    }

    /// Validate and insert a new job.
    ///
    /// Fails with `DuplicateJob` if the name is taken; the stored job is left
    /// as it was. `next_run_at` is computed unless the job already carries one.
    pub async fn add(&self, mut job: Job) -> Result<Job, SchedulerError> {
        job.validate()?;
        self.registry.check(&job.command)?;

        let now = self.clock.now();
        if job.next_run_at.is_none() {
            job.next_run_at = Some(job.schedule.first_run(
                now,
                self.timezone,
                self.interval_immediate,
            )?);
        }
        job.created_at = now;
        job.updated_at = now;

        self.storage
            .insert_job(job.clone())
            .await
            .map_err(|e| SchedulerError::for_job(e, &job.name))?;

        info!(
            job = %job.name,
            schedule = %job.schedule,
            next_run_at = ?job.next_run_at,
            enabled = job.enabled,
            "Job added"
        );
        Ok(job)
    }

    /// Delete a job from the table.
    pub async fn remove(&self, name: &JobName) -> Result<(), SchedulerError> {
        self.storage
            .delete_job(name)
            .await
            .map_err(|e| SchedulerError::for_job(e, name))?;
        info!(job = %name, "Job removed");
        Ok(())
    }

    /// Enable a job, recomputing `next_run_at` if the stored one has lapsed.
    pub async fn enable(&self, name: &JobName) -> Result<(), SchedulerError> {
        let job = self.get(name).await?;
        let now = self.clock.now();
        let lapsed_next = job
            .schedule
            .first_run(now, self.timezone, self.interval_immediate)?;
        self.storage
            .set_enabled(name, true, Some(lapsed_next), now)
            .await
            .map_err(|e| SchedulerError::for_job(e, name))?;
        info!(job = %name, "Job enabled");
        Ok(())
    }

    /// Disable a job. It stays stored and keeps its `next_run_at`.
    pub async fn disable(&self, name: &JobName) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        self.storage
            .set_enabled(name, false, None, now)
            .await
            .map_err(|e| SchedulerError::for_job(e, name))?;
        info!(job = %name, "Job disabled");
        Ok(())
    }

    pub async fn get(&self, name: &JobName) -> Result<Job, SchedulerError> {
        self.storage
            .get_job(name)
            .await
            .map_err(|e| SchedulerError::for_job(e, name))
    }

    /// Summaries of all jobs, oldest first.
    pub async fn list(&self) -> Result<Vec<JobSummary>, SchedulerError> {
        let jobs = self.storage.list_jobs().await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// Queue a one-time job.
    ///
    /// `at` of `None` (or a time not in the future) runs it on the next tick,
    /// and wakes the attached scheduler if there is one.
    pub async fn run_once(
        &self,
        command: JobCommand,
        at: Option<DateTime<Utc>>,
        options: RunOnceOptions,
    ) -> Result<Job, SchedulerError> {
        let now = self.clock.now();
        let name = one_time_name(&command, now);

        let mut job = Job::new(name, command, Schedule::once(at))
            .with_timeout(options.timeout.unwrap_or(self.default_timeout));
        job.max_retries = options.max_retries;
        job.description = options.description;

        let job = self.add(job).await?;

        let run_now = at.is_none_or(|at| at <= now);
        if run_now {
            if let Some(handle) = &self.handle {
                if let Err(e) = handle.wake().await {
                    debug!(job = %job.name, error = %e, "Could not wake scheduler");
                }
            }
        }
        Ok(job)
    }

    /// Run history, newest first.
    pub async fn history(
        &self,
        job: Option<&JobName>,
        limit: usize,
    ) -> Result<Vec<StoredRun>, SchedulerError> {
        Ok(self.storage.list_runs(job, limit).await?)
    }

    /// Insert jobs whose names are not stored yet; existing ones are kept as
    /// they are.
    pub async fn import(&self, jobs: Vec<Job>) -> Result<ImportReport, SchedulerError> {
        let mut report = ImportReport::default();
        for job in jobs {
            match self.storage.get_job(&job.name).await {
                Ok(_) => {
                    debug!(job = %job.name, "Job already stored, keeping it");
                    report.skipped.push(job.name);
                }
                Err(StorageError::NotFound(_)) => {
                    let name = job.name.clone();
                    match self.add(job).await {
                        Ok(_) => report.inserted.push(name),
                        // Lost a race with another writer.
                        Err(SchedulerError::DuplicateJob(_)) => report.skipped.push(name),
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    /// Every stored job, oldest first.
    pub async fn export(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.storage.list_jobs().await?)
    }
}

/// `onetime_<kind>_<YYYYmmdd_HHMMSS>_<8 hex>`.
fn one_time_name(command: &JobCommand, now: DateTime<Utc>) -> String {
    let label: String = command
        .label()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "onetime_{}_{}_{}",
        label,
        now.format("%Y%m%d_%H%M%S"),
        RunId::new().short()
    )
}
