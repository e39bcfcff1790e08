//! Configuration type definitions.
//!
//! This module contains the type definitions for the YAML configuration
//! document: scheduler settings, storage, retry defaults, logging, the
//! control API, job types and seed schedules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::job::JobTypeRegistry;
use crate::core::retry::RetryPolicy;

/// The configuration document (harvest.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    /// Global retry defaults; jobs may override count and delay.
    pub retry: RetryPolicy,
    /// Timeout for jobs that do not set one.
    pub default_timeout_secs: u64,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    /// Advisory lock file holding the scheduler's PID.
    pub lock_file: String,
    /// Typed job kinds and the base command each one runs.
    pub job_types: JobTypeRegistry,
    /// Jobs imported into the job table on start when missing.
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryPolicy::default(),
            default_timeout_secs: 3600,
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
            lock_file: "~/.earnings_data/harvest.pid".to_string(),
            job_types: JobTypeRegistry::new()
                .with_type("transcripts", "earnings-download-transcripts")
                .with_type("sec", "earnings-download-sec")
                .with_type("index", "earnings-index"),
            schedules: vec![ScheduleEntry::seed()],
        }
    }
}

/// Dispatch loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub workers: usize,
    pub tick_interval_secs: u64,
    /// How long `stop` waits for in-flight runs.
    pub shutdown_timeout_secs: u64,
    /// IANA timezone for daily, weekly and cron schedules.
    pub timezone: String,
    pub interval_first_run: IntervalFirstRun,
    /// Run records kept (0 keeps everything).
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            tick_interval_secs: 1,
            shutdown_timeout_secs: 30,
            timezone: "UTC".to_string(),
            interval_first_run: IntervalFirstRun::default(),
            history_limit: 1000,
        }
    }
}

/// When a newly added interval job first fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalFirstRun {
    /// One full period after being added.
    #[default]
    Delayed,
    /// On the next tick.
    Immediate,
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database or document path; ignored by the memory backend.
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: None,
        }
    }
}

impl StorageConfig {
    /// The configured path, or the backend's default location.
    pub fn path_or_default(&self) -> Option<&str> {
        match self.backend {
            StorageBackend::Memory => None,
            StorageBackend::Sqlite => {
                Some(self.path.as_deref().unwrap_or("~/.earnings_data/harvest.db"))
            }
            StorageBackend::Json => Some(
                self.path
                    .as_deref()
                    .unwrap_or("~/.earnings_data/harvest_jobs.json"),
            ),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-memory storage (non-persistent).
    Memory,
    /// SQLite database.
    Sqlite,
    /// Single JSON document.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// Write log output to this file instead of stderr. Rotated files are
    /// named `<stem>.<date>.<ext>` next to it.
    pub file: Option<String>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    /// Rotated files kept, measured in days of output.
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Pretty,
            rotation: LogRotation::Daily,
            retention_days: 30,
        }
    }
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Control API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

/// One seed job, in the flat shape used by the config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Job name.
    pub name: String,
    /// Typed job kind (see `job_types`). Exclusive with `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    /// Shell command. Exclusive with `job_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: ScheduleSpec,
    /// Options rendered as `--key value` flags of a typed job.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScheduleEntry {
    /// Daily transcript download at 02:00.
    pub fn seed() -> Self {
        Self {
            name: "daily_transcripts".to_string(),
            job_type: Some("transcripts".to_string()),
            command: None,
            enabled: true,
            schedule: ScheduleSpec {
                kind: "daily".to_string(),
                time: Some("02:00".to_string()),
                ..ScheduleSpec::default()
            },
            options: BTreeMap::new(),
            timeout_secs: None,
            max_retries: None,
            retry_delay_secs: None,
            description: Some("Download the current month's earnings call transcripts".to_string()),
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}

/// Schedule parameters in the flat config shape.
///
/// `type` selects which of the other fields apply: `daily` (time), `weekly`
/// (day, time), `interval` (hours, minutes, seconds), `cron` (cron) or
/// `one_time` (at).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// RFC 3339 time for one-time jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}
