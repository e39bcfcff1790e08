//! YAML configuration parsing.
//!
//! Loads, validates and saves the configuration document, and converts seed
//! schedule entries to and from [`Job`]s.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use super::types::{Config, IntervalFirstRun, ScheduleEntry, ScheduleSpec};
use crate::core::job::{Job, JobCommand};
use crate::core::schedule::{DayOfWeek, Schedule, TimeOfDay, parse_timezone};

/// Directory under the home directory holding harvest's files.
const DATA_DIR: &str = ".earnings_data";

/// Default configuration path: `~/.earnings_data/harvest.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR)
        .join("harvest.yaml")
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Config::default())
        }
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a file, creating parent directories.
    pub fn save(config: &Config, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let yaml = serde_yaml::to_string(config)?;
        std::fs::write(path, yaml).map_err(write_err)?;
        tracing::info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Write the default configuration. Refuses to overwrite unless `force`.
    pub fn init(path: impl AsRef<Path>, force: bool) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let config = Config::default();
        Self::save(&config, path)?;
        Ok(config)
    }
}

impl Config {
    /// Check every setting and seed schedule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.workers must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.tick_interval_secs must be at least 1".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "default_timeout_secs must be at least 1".into(),
            ));
        }
        self.timezone()?;
        if self.lock_file.trim().is_empty() {
            return Err(ConfigError::MissingField("lock_file".into()));
        }
        if let crate::core::retry::Backoff::Exponential { multiplier } = self.retry.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "retry.backoff.multiplier must be >= 1, got {}",
                    multiplier
                )));
            }
        }

        let mut names = HashSet::new();
        for entry in &self.schedules {
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate schedule name: {}",
                    entry.name
                )));
            }
            let job = entry.to_job(self.default_timeout())?;
            job.validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("job '{}': {}", entry.name, e)))?;
            self.job_types
                .check(&job.command)
                .map_err(|e| ConfigError::InvalidConfig(format!("job '{}': {}", entry.name, e)))?;
        }
        Ok(())
    }

    /// The configured timezone.
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        parse_timezone(&self.scheduler.timezone)
            .map_err(|e| ConfigError::InvalidConfig(format!("scheduler.timezone: {}", e)))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn interval_immediate(&self) -> bool {
        self.scheduler.interval_first_run == IntervalFirstRun::Immediate
    }

    pub fn lock_path(&self) -> PathBuf {
        expand_path(&self.lock_file)
    }

    /// Storage location with `~` expanded; `None` for the memory backend.
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage.path_or_default().map(expand_path)
    }

    /// Seed schedules as jobs.
    pub fn seed_jobs(&self) -> Result<Vec<Job>, ConfigError> {
        self.schedules
            .iter()
            .map(|entry| entry.to_job(self.default_timeout()))
            .collect()
    }
}

impl ScheduleEntry {
    /// Build the job this entry describes.
    pub fn to_job(&self, default_timeout: Duration) -> Result<Job, ConfigError> {
        let command = match (&self.job_type, &self.command) {
            (Some(kind), None) => JobCommand::typed(kind.clone(), self.options.clone()),
            (None, Some(command)) => {
                if !self.options.is_empty() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "job '{}': options only apply to job_type entries",
                        self.name
                    )));
                }
                JobCommand::shell(command.clone())
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{}': set either job_type or command, not both",
                    self.name
                )));
            }
            (None, None) => {
                return Err(ConfigError::MissingField(format!(
                    "{}.job_type or {}.command",
                    self.name, self.name
                )));
            }
        };

        let schedule = self.schedule.to_schedule(&self.name)?;
        let mut job = Job::new(self.name.as_str(), command, schedule)
            .with_enabled(self.enabled)
            .with_timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
            );
        job.max_retries = self.max_retries;
        job.retry_delay = self.retry_delay_secs.map(Duration::from_secs);
        job.description = self.description.clone();
        Ok(job)
    }

    /// Describe a stored job as a config entry.
    pub fn from_job(job: &Job) -> Self {
        let (job_type, command, options) = match &job.command {
            JobCommand::Shell { command } => (None, Some(command.clone()), Default::default()),
            JobCommand::Typed { kind, options } => (Some(kind.clone()), None, options.clone()),
        };
        Self {
            name: job.name.to_string(),
            job_type,
            command,
            enabled: job.enabled,
            schedule: ScheduleSpec::from(&job.schedule),
            options,
            timeout_secs: Some(job.timeout.as_secs()),
            max_retries: job.max_retries,
            retry_delay_secs: job.retry_delay.map(|d| d.as_secs()),
            description: job.description.clone(),
        }
    }
}

impl ScheduleSpec {
    /// Convert to a validated [`Schedule`]. `job` names the entry in errors.
    pub fn to_schedule(&self, job: &str) -> Result<Schedule, ConfigError> {
        let invalid = |e: crate::core::schedule::ScheduleError| {
            ConfigError::InvalidConfig(format!("job '{}': {}", job, e))
        };
        let missing = |field: &str| {
            ConfigError::MissingField(format!("{}.schedule.{} ({} schedule)", job, field, self.kind))
        };

        match self.kind.to_lowercase().as_str() {
            "daily" => {
                let time = self.time.as_deref().ok_or_else(|| missing("time"))?;
                Ok(Schedule::Daily {
                    time: time.parse::<TimeOfDay>().map_err(invalid)?,
                })
            }
            "weekly" => {
                let day = self.day.as_deref().ok_or_else(|| missing("day"))?;
                let time = self.time.as_deref().ok_or_else(|| missing("time"))?;
                Ok(Schedule::Weekly {
                    day: day.parse::<DayOfWeek>().map_err(invalid)?,
                    time: time.parse::<TimeOfDay>().map_err(invalid)?,
                })
            }
            "interval" => {
                let seconds = self
                    .hours
                    .unwrap_or(0)
                    .checked_mul(3600)
                    .and_then(|s| s.checked_add(self.minutes.unwrap_or(0).checked_mul(60)?))
                    .and_then(|s| s.checked_add(self.seconds.unwrap_or(0)))
                    .ok_or_else(|| {
                        ConfigError::InvalidConfig(format!("job '{}': interval is too long", job))
                    })?;
                if seconds == 0 {
                    return Err(missing("hours, minutes or seconds"));
                }
                Schedule::every(Duration::from_secs(seconds)).map_err(invalid)
            }
            "cron" => {
                let expression = self.cron.as_deref().ok_or_else(|| missing("cron"))?;
                Schedule::cron(expression).map_err(invalid)
            }
            "one_time" | "once" => {
                let at = self
                    .at
                    .as_deref()
                    .map(|s| parse_datetime(s, chrono_tz::UTC))
                    .transpose()
                    .map_err(|e| ConfigError::InvalidConfig(format!("job '{}': {}", job, e)))?;
                Ok(Schedule::once(at))
            }
            other => Err(ConfigError::InvalidConfig(format!(
                "job '{}': unknown schedule type '{}'",
                job, other
            ))),
        }
    }
}

impl From<&Schedule> for ScheduleSpec {
    fn from(schedule: &Schedule) -> Self {
        let mut spec = ScheduleSpec {
            kind: schedule.kind().to_string(),
            ..ScheduleSpec::default()
        };
        match schedule {
            Schedule::Daily { time } => spec.time = Some(time.to_string()),
            Schedule::Weekly { day, time } => {
                spec.day = Some(day.to_string());
                spec.time = Some(time.to_string());
            }
            Schedule::Interval { seconds } => {
                let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
                spec.hours = (h > 0).then_some(h);
                spec.minutes = (m > 0).then_some(m);
                spec.seconds = (s > 0).then_some(s);
            }
            Schedule::Cron { expression } => spec.cron = Some(expression.clone()),
            Schedule::OneTime { at } => spec.at = at.map(|at| at.to_rfc3339()),
        }
        spec
    }
}

/// Parse an RFC 3339 timestamp, or `YYYY-MM-DD HH:MM[:SS]` in `tz`.
pub fn parse_datetime(s: &str, tz: Tz) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| format!("invalid time '{}': expected YYYY-MM-DD HH:MM", s))?;
    naive
        .and_local_timezone(tz)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| format!("time '{}' does not exist in {}", s, tz))
}
