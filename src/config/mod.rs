//! Configuration loading and parsing.
//!
//! This module provides the YAML configuration document: global defaults for
//! the scheduler, storage, retries, logging and the control API, the job type
//! table, and seed schedules.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{
    ApiConfig, Config, IntervalFirstRun, LogFormat, LogRotation, LoggingConfig, ScheduleEntry,
    ScheduleSpec, SchedulerConfig, StorageBackend, StorageConfig,
};
pub use yaml::{YamlLoader, default_config_path, expand_path, parse_datetime};
