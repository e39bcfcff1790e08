//! Job execution engine.
//!
//! The `JobExecutor` runs one dispatched job to a terminal state:
//! - each attempt holds a worker slot from the shared semaphore
//! - failed attempts are retried according to the job's retry policy
//! - the slot is released while waiting out a backoff
//! - a shutdown signal abandons pending retries

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::command::{CommandOutput, CommandRunner, ExecutionError};
use crate::core::clock::{Clock, SystemClock};
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobName, RunId};
use crate::events::{Event, EventBus};

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Exit status 0.
    Succeeded,
    /// Non-zero exit, or killed by a signal (`exit_code` is `None`).
    Failed { exit_code: Option<i32> },
    /// Killed after exceeding the timeout.
    TimedOut(Duration),
    /// The command could not be started or waited on.
    LaunchFailed(String),
}

impl AttemptOutcome {
    fn from_result(result: &Result<CommandOutput, ExecutionError>) -> Self {
        match result {
            Ok(output) if output.success() => AttemptOutcome::Succeeded,
            Ok(output) => AttemptOutcome::Failed {
                exit_code: output.exit_code,
            },
            Err(ExecutionError::TimedOut(limit)) => AttemptOutcome::TimedOut(*limit),
            Err(e) => AttemptOutcome::LaunchFailed(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }

    /// Timeouts and launch failures may go away on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::TimedOut(_) | AttemptOutcome::LaunchFailed(_)
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AttemptOutcome::Succeeded => Some(0),
            AttemptOutcome::Failed { exit_code } => *exit_code,
            _ => None,
        }
    }

    /// Human-readable failure description.
    pub fn describe(&self) -> String {
        match self {
            AttemptOutcome::Succeeded => "succeeded".to_string(),
            AttemptOutcome::Failed {
                exit_code: Some(code),
            } => format!("exit code {}", code),
            AttemptOutcome::Failed { exit_code: None } => "terminated by signal".to_string(),
            AttemptOutcome::TimedOut(limit) => format!("timed out after {}s", limit.as_secs()),
            AttemptOutcome::LaunchFailed(msg) => msg.clone(),
        }
    }
}

/// Result of one attempt, available to the retry decision.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub stdout: String,
    pub stderr: String,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// Retries exhausted (or not allowed); `error` describes the last attempt.
    Failed { error: String },
    /// Shutdown arrived before the next attempt could start.
    Abandoned,
}

/// Everything that happened while running one dispatched job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub outcome: RunOutcome,
    pub attempts: Vec<ExecutionRecord>,
    /// Wall time from dispatch to terminal state, including backoff waits.
    pub duration: Duration,
}

impl JobResult {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_attempt(&self) -> Option<&ExecutionRecord> {
        self.attempts.last()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.last_attempt().and_then(|a| a.outcome.exit_code())
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// One dispatch handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job: JobName,
    pub run_id: RunId,
    /// Fully resolved shell command line.
    pub command: String,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

/// Executor for running jobs with a bounded worker pool and retry logic.
pub struct JobExecutor {
    runner: Arc<dyn CommandRunner>,
    /// Maximum number of concurrently executing commands.
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    echo_output: bool,
}

impl JobExecutor {
    /// Create a new executor with the given worker count.
    pub fn new(runner: Arc<dyn CommandRunner>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            runner,
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            clock: Arc::new(SystemClock),
            event_bus: None,
            echo_output: false,
        }
    }

    /// Use a different clock for attempt timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish lifecycle events on this bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Print captured command output to stdout after each attempt.
    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    /// Get the worker pool size.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Get the number of free worker slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }

    /// Wait for a worker slot, or `None` if shutdown arrives first.
    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Option<OwnedSemaphorePermit> {
        if *shutdown.borrow() {
            return None;
        }
        let acquire = self.semaphore.clone().acquire_owned();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                permit = &mut acquire => return permit.ok(),
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => return None,
                    Ok(()) => continue,
                    // Sender gone: nobody can signal shutdown any more.
                    Err(_) => return (&mut acquire).await.ok(),
                },
            }
        }
    }

    /// Run a job to a terminal state.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> JobResult {
        let started = Instant::now();
        let policy = &request.retry_policy;
        let max_attempts = policy.max_attempts();
        let mut attempts: Vec<ExecutionRecord> = Vec::new();

        loop {
            let attempt = attempts.len() as u32 + 1;

            let Some(permit) = self.acquire(shutdown).await else {
                return self.abandon(request, attempts, started).await;
            };

            info!(
                job = %request.job,
                run_id = %request.run_id,
                attempt,
                max_attempts,
                "Starting attempt"
            );
            self.emit(Event::attempt_started(
                request.job.clone(),
                request.run_id.clone(),
                attempt,
                max_attempts,
            ))
            .await;

            let started_at = self.clock.now();
            let result = self.runner.execute(&request.command, request.timeout).await;
            drop(permit);

            let outcome = AttemptOutcome::from_result(&result);
            let (stdout, stderr) = match result {
                Ok(output) => (output.stdout, output.stderr),
                Err(_) => (String::new(), String::new()),
            };
            if self.echo_output {
                echo(&request.job, &request.run_id, &stdout, &stderr);
            }

            let record = ExecutionRecord {
                attempt,
                started_at,
                ended_at: self.clock.now(),
                outcome: outcome.clone(),
                stdout,
                stderr,
            };
            attempts.push(record);

            if outcome.is_success() {
                let duration = started.elapsed();
                info!(
                    job = %request.job,
                    run_id = %request.run_id,
                    attempts = attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Job succeeded"
                );
                let stdout = attempts
                    .last()
                    .map(|a| a.stdout.clone())
                    .filter(|s| !s.is_empty());
                self.emit(Event::job_succeeded(
                    request.job.clone(),
                    request.run_id.clone(),
                    attempt,
                    duration,
                    stdout,
                ))
                .await;
                return JobResult {
                    outcome: RunOutcome::Succeeded,
                    attempts,
                    duration,
                };
            }

            let error = outcome.describe();
            warn!(
                job = %request.job,
                run_id = %request.run_id,
                attempt,
                max_attempts,
                error = %error,
                "Attempt failed"
            );
            let stderr = attempts
                .last()
                .map(|a| a.stderr.clone())
                .filter(|s| !s.is_empty());
            self.emit(Event::attempt_failed(
                request.job.clone(),
                request.run_id.clone(),
                attempt,
                error.clone(),
                outcome.exit_code(),
                stderr,
            ))
            .await;

            if !policy.should_retry(attempt, outcome.is_transient()) {
                let duration = started.elapsed();
                error!(
                    job = %request.job,
                    run_id = %request.run_id,
                    attempts = attempt,
                    error = %error,
                    "Job failed, no retries left"
                );
                self.emit(Event::job_failed(
                    request.job.clone(),
                    request.run_id.clone(),
                    attempt,
                    error.clone(),
                    duration,
                ))
                .await;
                return JobResult {
                    outcome: RunOutcome::Failed { error },
                    attempts,
                    duration,
                };
            }

            let delay = policy.delay_for(attempt);
            info!(
                job = %request.job,
                run_id = %request.run_id,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "Retry scheduled"
            );
            self.emit(Event::retry_scheduled(
                request.job.clone(),
                request.run_id.clone(),
                attempt,
                max_attempts,
                delay,
            ))
            .await;

            if wait_or_shutdown(delay, shutdown).await {
                return self.abandon(request, attempts, started).await;
            }
        }
    }

    async fn abandon(
        &self,
        request: &ExecutionRequest,
        attempts: Vec<ExecutionRecord>,
        started: Instant,
    ) -> JobResult {
        let count = attempts.len() as u32;
        warn!(
            job = %request.job,
            run_id = %request.run_id,
            attempts = count,
            "Scheduler stopping, abandoning run"
        );
        self.emit(Event::job_abandoned(
            request.job.clone(),
            request.run_id.clone(),
            count,
        ))
        .await;
        JobResult {
            outcome: RunOutcome::Abandoned,
            attempts,
            duration: started.elapsed(),
        }
    }
}

/// Sleep for `delay`; returns `true` if shutdown was signalled first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let timer = sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    (&mut timer).await;
                    return false;
                }
            },
        }
    }
}

fn echo(job: &JobName, run_id: &RunId, stdout: &str, stderr: &str) {
    let prefix = format!("[{}:{}]", job, run_id.short());
    for line in stdout.lines() {
        println!("{} {}", prefix, line);
    }
    for line in stderr.lines() {
        eprintln!("{} {}", prefix, line);
    }
}
