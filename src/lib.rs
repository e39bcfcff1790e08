//! harvest - a persistent shell-command scheduler.
//!
//! Jobs run on daily, weekly, interval, cron or one-time schedules, with
//! retry and backoff, a bounded worker pool and durable run history.

pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod logging;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{Config, ConfigError, ScheduleEntry, ScheduleSpec, YamlLoader};
pub use core::clock::{Clock, SystemClock};
pub use core::job::{Job, JobCommand, JobError, JobSummary, JobTypeRegistry, RunStatus};
pub use core::retry::{Backoff, RetryCondition, RetryPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{JobName, RunId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{CommandOutput, CommandRunner, ExecutionError, JobExecutor, ShellRunner};
pub use scheduler::{
    JobManager, RunOnceOptions, Scheduler, SchedulerError, SchedulerHandle, SchedulerState,
    SchedulerStatus,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{FileStorage, InMemoryStorage, Storage, StorageError, StoredRun};
