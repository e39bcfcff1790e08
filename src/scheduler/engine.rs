//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Dispatching due jobs from the persisted job table
//! - Keeping each job to one execution at a time
//! - Recording run history and the next fire time
//! - Removing one-time jobs once they finish
//! - Recovery from interruptions
//! - Event emission

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub use super::handle::SchedulerHandle;
use super::handle::COMMAND_CHANNEL_BUFFER;
use super::lock::SchedulerLock;
use super::manager::JobManager;
pub use super::types::{SchedulerError, SchedulerState, SchedulerStatus};
use super::types::SchedulerCommand;
use crate::core::clock::{Clock, SystemClock};
use crate::core::job::{Job, JobTypeRegistry, RunStatus};
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobName, RunId};
use crate::events::{Event, EventBus};
use crate::execution::{
    CommandRunner, ExecutionRequest, JobExecutor, JobResult, RunOutcome, ShellRunner,
    truncate_output,
};
use crate::storage::{DEFAULT_HISTORY_LIMIT, Storage, StorageError, StoredRun};

/// Default number of worker slots.
pub const DEFAULT_WORKERS: usize = 5;

/// The main scheduler that dispatches jobs from the job table.
pub struct Scheduler<S: Storage> {
    /// Storage backend.
    storage: Arc<S>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Runs the resolved command lines.
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    registry: JobTypeRegistry,
    /// Global retry settings, overridden per job.
    retry_defaults: RetryPolicy,
    /// Tick interval for checking schedules.
    tick_interval: Duration,
    /// Worker pool size.
    workers: usize,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    history_limit: usize,
    interval_immediate: bool,
    echo_output: bool,
    lock_path: Option<PathBuf>,
    /// Jobs inserted at start if their names are not stored yet.
    seed_jobs: Vec<Job>,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            event_bus: Arc::new(EventBus::new()),
            runner: Arc::new(ShellRunner::new()),
            clock: Arc::new(SystemClock),
            timezone: chrono_tz::UTC,
            registry: JobTypeRegistry::new(),
            retry_defaults: RetryPolicy::default(),
            tick_interval: Duration::from_secs(1),
            workers: DEFAULT_WORKERS,
            shutdown_timeout: Duration::from_secs(30),
            history_limit: DEFAULT_HISTORY_LIMIT,
            interval_immediate: false,
            echo_output: false,
            lock_path: None,
            seed_jobs: Vec::new(),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the command runner.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Timezone that daily, weekly and cron schedules are evaluated in.
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_job_types(mut self, registry: JobTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_defaults(mut self, policy: RetryPolicy) -> Self {
        self.retry_defaults = policy;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Keep at most this many run records (0 keeps everything).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Fire new interval jobs on the next tick instead of after one period.
    pub fn with_interval_immediate(mut self, immediate: bool) -> Self {
        self.interval_immediate = immediate;
        self
    }

    /// Print command output as attempts finish.
    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    /// Hold this lock file while running.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Jobs to insert at start when missing from storage.
    pub fn with_seed_jobs(mut self, jobs: Vec<Job>) -> Self {
        self.seed_jobs = jobs;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// A job manager sharing this scheduler's storage, clock, timezone and
    /// job types.
    pub fn manager(&self) -> JobManager<S> {
        JobManager::new(Arc::clone(&self.storage))
            .with_clock(Arc::clone(&self.clock))
            .with_timezone(self.timezone)
            .with_job_types(self.registry.clone())
            .with_interval_immediate(self.interval_immediate)
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// Acquires the lock file, marks runs left over by a previous process as
    /// interrupted, imports seed jobs and fills in missing fire times before
    /// the loop starts. Any failure here is returned and nothing is spawned.
    pub async fn start(mut self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let lock = match &self.lock_path {
            Some(path) => Some(SchedulerLock::acquire(path)?),
            None => None,
        };

        let recovered = self.recover().await?;
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                "Marked runs from a previous process as interrupted"
            );
        }

        let seeds = std::mem::take(&mut self.seed_jobs);
        if !seeds.is_empty() {
            let report = self.manager().import(seeds).await?;
            info!(
                inserted = report.inserted.len(),
                skipped = report.skipped.len(),
                "Imported configured schedules"
            );
        }

        self.prepare_jobs().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let runtime = Runtime::new(self, lock);
        info!(
            workers = runtime.executor.max_workers(),
            tick_ms = runtime.tick_interval.as_millis() as u64,
            "Scheduler started"
        );

        let scheduler_task = tokio::spawn(async move {
            runtime.run(command_rx, state).await;
        });

        Ok((handle, scheduler_task))
    }

    /// Recover interrupted runs from storage.
    ///
    /// Every run still marked `running` belonged to a process that is gone
    /// (the lock guarantees it), so it is marked interrupted.
    pub async fn recover(&self) -> Result<Vec<RunId>, SchedulerError> {
        let incomplete_runs = self.storage.get_incomplete_runs().await?;
        let now = self.clock.now();
        let mut recovered = Vec::new();

        for run in incomplete_runs {
            self.storage.mark_run_interrupted(&run.id, now).await?;
            warn!(job = %run.job_name, run_id = %run.id, "Run was interrupted");
            recovered.push(run.id);
        }

        Ok(recovered)
    }

    /// Fill in missing fire times and report overdue jobs.
    ///
    /// An overdue job keeps its past `next_run_at`, so it fires once on the
    /// first tick no matter how many occurrences were missed.
    async fn prepare_jobs(&self) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        for job in self.storage.list_jobs().await? {
            match job.next_run_at {
                None => {
                    let next = match job.schedule.first_run(
                        now,
                        self.timezone,
                        self.interval_immediate,
                    ) {
                        Ok(next) => next,
                        Err(e) => {
                            error!(job = %job.name, error = %e, "Cannot compute next run");
                            continue;
                        }
                    };
                    self.storage.update_next_run(&job.name, Some(next)).await?;
                    debug!(job = %job.name, next_run_at = %next, "Scheduled job");
                }
                Some(next) if job.enabled && next < now => {
                    info!(
                        job = %job.name,
                        missed_since = %next,
                        "Job missed its schedule, running once now"
                    );
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// State that only exists while the loop runs.
struct Runtime<S: Storage> {
    storage: Arc<S>,
    event_bus: Arc<EventBus>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    registry: JobTypeRegistry,
    retry_defaults: RetryPolicy,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    history_limit: usize,
    /// Currently running job handles, keyed by job name.
    running_jobs: RwLock<HashMap<JobName, (RunId, JoinHandle<()>)>>,
    shutdown_tx: watch::Sender<bool>,
    lock: Option<SchedulerLock>,
}

impl<S: Storage + 'static> Runtime<S> {
    fn new(scheduler: Scheduler<S>, lock: Option<SchedulerLock>) -> Self {
        let executor = JobExecutor::new(scheduler.runner, scheduler.workers)
            .with_clock(Arc::clone(&scheduler.clock))
            .with_event_bus(Arc::clone(&scheduler.event_bus))
            .with_echo_output(scheduler.echo_output);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            storage: scheduler.storage,
            event_bus: scheduler.event_bus,
            executor: Arc::new(executor),
            clock: scheduler.clock,
            timezone: scheduler.timezone,
            registry: scheduler.registry,
            retry_defaults: scheduler.retry_defaults,
            tick_interval: scheduler.tick_interval,
            shutdown_timeout: scheduler.shutdown_timeout,
            history_limit: scheduler.history_limit,
            running_jobs: RwLock::new(HashMap::new()),
            shutdown_tx,
            lock,
        }
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_finished_jobs().await;
                    self.tick().await;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Wake { response } => {
                            self.cleanup_finished_jobs().await;
                            self.tick().await;
                            let _ = response.send(());
                        }
                        SchedulerCommand::Status { response } => {
                            self.cleanup_finished_jobs().await;
                            let current = *state.read().await;
                            let _ = response.send(self.status(current).await);
                        }
                        SchedulerCommand::Shutdown { response } => {
                            let mut s = state.write().await;
                            *s = SchedulerState::Stopping;
                            drop(s); // Release the lock before waiting

                            info!("Scheduler stopping");
                            // Abandons pending retry backoffs; running commands continue.
                            self.shutdown_tx.send_replace(true);
                            self.await_running_jobs().await;

                            if let Some(lock) = self.lock.take() {
                                lock.release();
                            }
                            *state.write().await = SchedulerState::Stopped;
                            info!("Scheduler stopped");

                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch every due job that is not already running.
    ///
    /// A storage failure is logged as a dispatch fault; the next tick tries
    /// again.
    async fn tick(&self) {
        let now = self.clock.now();
        let due = match self.storage.due_jobs(now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Dispatch fault: failed to read due jobs");
                return;
            }
        };

        for job in due {
            if self.is_running(&job.name).await {
                debug!(job = %job.name, "Job still running, skipping this tick");
                continue;
            }
            let name = job.name.clone();
            if let Err(e) = self.dispatch(job, now).await {
                error!(job = %name, error = %e, "Dispatch fault");
            }
        }
    }

    async fn is_running(&self, name: &JobName) -> bool {
        self.running_jobs
            .read()
            .await
            .get(name)
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Record a new run and hand it to a worker task.
    async fn dispatch(&self, job: Job, now: DateTime<Utc>) -> Result<(), StorageError> {
        let run_id = RunId::new();
        let finalizer = Finalizer {
            storage: Arc::clone(&self.storage),
            event_bus: Arc::clone(&self.event_bus),
            clock: Arc::clone(&self.clock),
            timezone: self.timezone,
            history_limit: self.history_limit,
        };

        let command = match self.registry.resolve(&job.command) {
            Ok(command) => command,
            Err(e) => {
                // The job type was removed from config after the job was added.
                error!(job = %job.name, error = %e, "Cannot resolve command");
                let mut run = StoredRun::new(run_id, job.name.clone(), job.command.to_string(), now);
                run.mark_failed(now, e.to_string());
                self.storage.save_run(run).await?;
                finalizer.settle(&job, RunStatus::Failed, now).await;
                return Ok(());
            }
        };

        let run = StoredRun::new(run_id.clone(), job.name.clone(), command.clone(), now);
        self.storage.save_run(run.clone()).await?;

        info!(job = %job.name, run_id = %run_id, command = %command, "Dispatching job");
        self.event_bus
            .emit(Event::job_dispatched(job.name.clone(), run_id.clone()))
            .await;

        let request = ExecutionRequest {
            job: job.name.clone(),
            run_id: run_id.clone(),
            command,
            timeout: job.timeout,
            retry_policy: job.retry_policy(&self.retry_defaults),
        };
        let executor = Arc::clone(&self.executor);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let name = job.name.clone();

        let handle = tokio::spawn(async move {
            let result = executor.execute(&request, &mut shutdown_rx).await;
            finalizer.finish(&job, run, result).await;
        });

        self.running_jobs
            .write()
            .await
            .insert(name, (run_id, handle));
        Ok(())
    }

    async fn status(&self, state: SchedulerState) -> SchedulerStatus {
        let running = self.running_jobs.read().await;
        let mut running_jobs: Vec<JobName> = running
            .iter()
            .filter(|(_, (_, handle))| !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        running_jobs.sort();

        SchedulerStatus {
            state,
            running_jobs,
            workers: self.executor.max_workers(),
            free_slots: self.executor.available_permits(),
        }
    }

    /// Clean up finished job handles.
    async fn cleanup_finished_jobs(&self) {
        let mut running = self.running_jobs.write().await;
        running.retain(|_, (_, handle)| !handle.is_finished());
    }

    /// Wait for all running jobs to complete with a timeout.
    async fn await_running_jobs(&self) {
        let running_count = self.running_jobs.read().await.len();

        if running_count == 0 {
            info!("No running jobs to wait for during shutdown");
            return;
        }

        info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            running_count, self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            // Check if all jobs are done
            let mut running = self.running_jobs.write().await;
            running.retain(|_, (_, handle)| !handle.is_finished());
            let remaining = running.len();
            drop(running);

            if remaining == 0 {
                let elapsed = start.elapsed();
                info!("All running jobs completed gracefully in {:?}", elapsed);
                break;
            }

            // Check if we've exceeded the timeout
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    self.shutdown_timeout, remaining
                );
                break;
            }

            // Wait a bit before checking again
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Writes the result of a run back to storage.
struct Finalizer<S: Storage> {
    storage: Arc<S>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    history_limit: usize,
}

impl<S: Storage> Finalizer<S> {
    async fn finish(&self, job: &Job, mut run: StoredRun, result: JobResult) {
        let now = self.clock.now();
        run.attempts = result.attempt_count();
        run.exit_code = result.exit_code();
        if let Some(last) = result.last_attempt() {
            run.stdout = non_empty(truncate_output(last.stdout.clone()));
            run.stderr = non_empty(truncate_output(last.stderr.clone()));
        }

        let status = match &result.outcome {
            RunOutcome::Succeeded => {
                run.mark_succeeded(now);
                RunStatus::Succeeded
            }
            RunOutcome::Failed { error } => {
                run.mark_failed(now, error.clone());
                RunStatus::Failed
            }
            RunOutcome::Abandoned => {
                run.mark_interrupted(now, "scheduler stopped");
                RunStatus::Interrupted
            }
        };
        let started_at = run.started_at;

        if let Err(e) = self.storage.update_run(run).await {
            error!(job = %job.name, error = %e, "Failed to record run result");
        }
        self.settle(job, status, started_at).await;
    }

    /// Apply the terminal status of a run dispatched at `started_at` to the
    /// job table, then prune history.
    async fn settle(&self, job: &Job, status: RunStatus, started_at: DateTime<Utc>) {
        let now = self.clock.now();

        if job.is_one_time() && status != RunStatus::Interrupted {
            match self.storage.delete_job(&job.name).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {
                    info!(job = %job.name, status = %status, "One-time job finished, removed");
                    self.event_bus
                        .emit(Event::job_removed(job.name.clone()))
                        .await;
                }
                Err(e) => error!(job = %job.name, error = %e, "Failed to remove one-time job"),
            }
        } else {
            // An abandoned one-time job keeps its fire time and runs on the next start.
            let next = if job.is_one_time() {
                job.next_run_at
            } else {
                match job.schedule.next_after(now, Some(started_at), self.timezone) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        error!(job = %job.name, error = %e, "Cannot compute next run");
                        None
                    }
                }
            };
            match self
                .storage
                .record_outcome(&job.name, started_at, status, next)
                .await
            {
                Ok(()) => debug!(job = %job.name, status = %status, next_run_at = ?next, "Recorded outcome"),
                Err(StorageError::NotFound(_)) => {
                    debug!(job = %job.name, "Job removed while running")
                }
                Err(e) => error!(job = %job.name, error = %e, "Failed to record outcome"),
            }
        }

        if self.history_limit > 0 {
            match self.storage.prune_runs(self.history_limit).await {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "Pruned run history"),
                Err(e) => warn!(error = %e, "Failed to prune run history"),
            }
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
