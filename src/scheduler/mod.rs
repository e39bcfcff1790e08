//! Scheduler engine for job execution.
//!
//! This module provides the main dispatch loop that runs due jobs from the
//! persisted job table, the handle used to control it, the job manager used
//! to edit the table, and the lock file that keeps a single scheduler active.

mod engine;
mod handle;
pub mod lock;
mod manager;
mod types;

pub use engine::{DEFAULT_WORKERS, Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use lock::{LockError, SchedulerLock};
pub use manager::{ImportReport, JobManager, RunOnceOptions};
pub use types::SchedulerStatus;
