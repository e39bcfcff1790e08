//! Lifecycle events and event handling.
//!
//! Every state change of a dispatched job (dispatch, attempts, retries,
//! terminal outcome, one-time cleanup) is published on an [`EventBus`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobName, RunId};

/// Lifecycle events emitted while running jobs.
#[derive(Debug, Clone)]
pub enum Event {
    /// A due job was handed to the worker pool.
    JobDispatched {
        job: JobName,
        run_id: RunId,
        timestamp: Instant,
    },

    /// An attempt acquired a worker slot and started its command.
    AttemptStarted {
        job: JobName,
        run_id: RunId,
        /// 1-indexed attempt number.
        attempt: u32,
        /// Total attempts allowed, including the first.
        max_attempts: u32,
        timestamp: Instant,
    },

    /// An attempt ended in failure (non-zero exit, timeout or launch error).
    AttemptFailed {
        job: JobName,
        run_id: RunId,
        attempt: u32,
        error: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
        timestamp: Instant,
    },

    /// A retry will start after `delay`.
    ///
    /// Emitted immediately before the backoff wait.
    RetryScheduled {
        job: JobName,
        run_id: RunId,
        /// The attempt number that just failed.
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        timestamp: Instant,
    },

    /// The run succeeded.
    JobSucceeded {
        job: JobName,
        run_id: RunId,
        attempts: u32,
        duration: Duration,
        stdout: Option<String>,
        timestamp: Instant,
    },

    /// The run failed after exhausting its retries.
    JobFailed {
        job: JobName,
        run_id: RunId,
        attempts: u32,
        error: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// The run stopped waiting for a retry because the scheduler shut down.
    JobAbandoned {
        job: JobName,
        run_id: RunId,
        attempts: u32,
        timestamp: Instant,
    },

    /// A one-time job reached a terminal state and was deleted.
    JobRemoved { job: JobName, timestamp: Instant },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobDispatched { timestamp, .. }
            | Event::AttemptStarted { timestamp, .. }
            | Event::AttemptFailed { timestamp, .. }
            | Event::RetryScheduled { timestamp, .. }
            | Event::JobSucceeded { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::JobAbandoned { timestamp, .. }
            | Event::JobRemoved { timestamp, .. } => *timestamp,
        }
    }

    /// Name of the job the event is about.
    pub fn job(&self) -> &JobName {
        match self {
            Event::JobDispatched { job, .. }
            | Event::AttemptStarted { job, .. }
            | Event::AttemptFailed { job, .. }
            | Event::RetryScheduled { job, .. }
            | Event::JobSucceeded { job, .. }
            | Event::JobFailed { job, .. }
            | Event::JobAbandoned { job, .. }
            | Event::JobRemoved { job, .. } => job,
        }
    }

    pub fn job_dispatched(job: JobName, run_id: RunId) -> Self {
        Event::JobDispatched {
            job,
            run_id,
            timestamp: Instant::now(),
        }
    }

    pub fn attempt_started(job: JobName, run_id: RunId, attempt: u32, max_attempts: u32) -> Self {
        Event::AttemptStarted {
            job,
            run_id,
            attempt,
            max_attempts,
            timestamp: Instant::now(),
        }
    }

    pub fn attempt_failed(
        job: JobName,
        run_id: RunId,
        attempt: u32,
        error: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    ) -> Self {
        Event::AttemptFailed {
            job,
            run_id,
            attempt,
            error,
            exit_code,
            stderr,
            timestamp: Instant::now(),
        }
    }

    pub fn retry_scheduled(
        job: JobName,
        run_id: RunId,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    ) -> Self {
        Event::RetryScheduled {
            job,
            run_id,
            attempt,
            max_attempts,
            delay,
            timestamp: Instant::now(),
        }
    }

    pub fn job_succeeded(
        job: JobName,
        run_id: RunId,
        attempts: u32,
        duration: Duration,
        stdout: Option<String>,
    ) -> Self {
        Event::JobSucceeded {
            job,
            run_id,
            attempts,
            duration,
            stdout,
            timestamp: Instant::now(),
        }
    }

    pub fn job_failed(
        job: JobName,
        run_id: RunId,
        attempts: u32,
        error: String,
        duration: Duration,
    ) -> Self {
        Event::JobFailed {
            job,
            run_id,
            attempts,
            error,
            duration,
            timestamp: Instant::now(),
        }
    }

    pub fn job_abandoned(job: JobName, run_id: RunId, attempts: u32) -> Self {
        Event::JobAbandoned {
            job,
            run_id,
            attempts,
            timestamp: Instant::now(),
        }
    }

    pub fn job_removed(job: JobName) -> Self {
        Event::JobRemoved {
            job,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
