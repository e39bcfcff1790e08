//! Job definition: what to run, when, and with which limits.
//!
//! A job is either a raw shell command or a typed command whose base command
//! line comes from the configured job-type table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::retry::{RetryPolicy, serde_duration, serde_opt_duration};
use super::schedule::{Schedule, ScheduleError};
use super::types::JobName;

/// Default per-execution timeout (one hour).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Errors that can occur when validating jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job name is empty or contains unsupported characters.
    #[error("invalid job name '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidName(String),

    /// Invalid schedule.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// The typed command refers to a kind that is not configured.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// An option cannot be rendered as a command-line flag.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of a finished (or abandoned) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is currently executing.
    Running,
    /// Run completed successfully.
    Succeeded,
    /// Run failed after exhausting its retries.
    Failed,
    /// Run was interrupted (scheduler stopped or crashed).
    Interrupted,
}

impl RunStatus {
    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// What a job executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobCommand {
    /// A command line passed verbatim to the shell.
    Shell { command: String },
    /// A registered job type plus options rendered as `--key value` flags.
    Typed {
        kind: String,
        #[serde(default)]
        options: BTreeMap<String, Value>,
    },
}

impl JobCommand {
    pub fn shell(command: impl Into<String>) -> Self {
        JobCommand::Shell {
            command: command.into(),
        }
    }

    pub fn typed(kind: impl Into<String>, options: BTreeMap<String, Value>) -> Self {
        JobCommand::Typed {
            kind: kind.into(),
            options,
        }
    }

    /// `shell` for raw commands, the kind for typed ones.
    pub fn label(&self) -> &str {
        match self {
            JobCommand::Shell { .. } => "shell",
            JobCommand::Typed { kind, .. } => kind,
        }
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCommand::Shell { command } => f.write_str(command),
            JobCommand::Typed { kind, options } if options.is_empty() => write!(f, "<{}>", kind),
            JobCommand::Typed { kind, options } => {
                let keys: Vec<&str> = options.keys().map(String::as_str).collect();
                write!(f, "<{}> {}", kind, keys.join(","))
            }
        }
    }
}

/// Table of typed job kinds and the base command each one runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTypeRegistry {
    types: BTreeMap<String, String>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a kind.
    pub fn with_type(mut self, kind: impl Into<String>, command: impl Into<String>) -> Self {
        self.register(kind, command);
        self
    }

    pub fn register(&mut self, kind: impl Into<String>, command: impl Into<String>) {
        self.types.insert(kind.into(), command.into());
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.types.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check that a command can be resolved without building it.
    pub fn check(&self, command: &JobCommand) -> Result<(), JobError> {
        self.resolve(command).map(|_| ())
    }

    /// Produce the shell command line for a job command.
    pub fn resolve(&self, command: &JobCommand) -> Result<String, JobError> {
        match command {
            JobCommand::Shell { command } => Ok(command.clone()),
            JobCommand::Typed { kind, options } => {
                let base = self
                    .types
                    .get(kind)
                    .ok_or_else(|| JobError::UnknownJobType(kind.clone()))?;
                let mut line = base.clone();
                for (key, value) in options {
                    render_option(&mut line, key, value)?;
                }
                Ok(line)
            }
        }
    }
}

fn render_option(line: &mut String, key: &str, value: &Value) -> Result<(), JobError> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(JobError::InvalidOption {
            key: key.to_string(),
            reason: "option names may only contain letters, digits, '_' and '-'".into(),
        });
    }
    let flag = format!("--{}", key.replace('_', "-"));

    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => {
            line.push(' ');
            line.push_str(&flag);
        }
        Value::Array(items) => {
            for item in items {
                render_option(line, key, item)?;
            }
        }
        Value::Object(_) => {
            return Err(JobError::InvalidOption {
                key: key.to_string(),
                reason: "nested objects cannot be passed as flags".into(),
            });
        }
        Value::String(s) => {
            line.push_str(&format!(" {} {}", flag, shell_quote(s)));
        }
        Value::Number(n) => {
            line.push_str(&format!(" {} {}", flag, n));
        }
    }
    Ok(())
}

/// Quote a value for `sh -c` unless it is made of safe characters only.
fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// A durable job definition plus its scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name.
    pub name: JobName,
    /// What to execute.
    pub command: JobCommand,
    /// When to execute it.
    pub schedule: Schedule,
    /// Disabled jobs stay stored but are never dispatched.
    pub enabled: bool,
    /// Per-execution timeout.
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    /// Overrides the global retry count.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the global retry delay.
    #[serde(default, with = "serde_opt_duration")]
    pub retry_delay: Option<Duration>,
    #[serde(default)]
    pub description: Option<String>,
    /// Next fire time, recomputed after each run and on schedule changes.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an enabled job with default timeout and no overrides.
    pub fn new(name: impl Into<JobName>, command: JobCommand, schedule: Schedule) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            command,
            schedule,
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
            max_retries: None,
            retry_delay: None,
            description: None,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shorthand for a shell-command job.
    pub fn shell(name: impl Into<JobName>, command: impl Into<String>, schedule: Schedule) -> Self {
        Self::new(name, JobCommand::shell(command), schedule)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Whether this job is removed after its first terminal run.
    pub fn is_one_time(&self) -> bool {
        !self.schedule.is_recurring()
    }

    /// Validate the definition on its own (name, schedule, timeout).
    pub fn validate(&self) -> Result<(), JobError> {
        let name = self.name.as_str();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(JobError::InvalidName(name.to_string()));
        }
        self.schedule.validate()?;
        if self.timeout.is_zero() {
            return Err(JobError::InvalidConfig(format!(
                "job '{}' has a zero timeout",
                name
            )));
        }
        Ok(())
    }

    /// The effective retry policy: job overrides applied over `defaults`.
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        let mut policy = defaults.clone();
        if let Some(max_retries) = self.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(delay) = self.retry_delay {
            policy.delay = delay;
        }
        policy
    }
}

/// Row shown by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: JobName,
    pub command: String,
    pub schedule: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            command: job.command.to_string(),
            schedule: job.schedule.to_string(),
            enabled: job.enabled,
            next_run_at: job.next_run_at,
            last_run_at: job.last_run_at,
            last_status: job.last_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> JobTypeRegistry {
        JobTypeRegistry::new()
            .with_type("transcripts", "earnings-transcripts download")
            .with_type("sec", "earnings-sec download")
    }

    #[test]
    fn test_shell_command_resolves_verbatim() {
        let cmd = JobCommand::shell("echo hello && exit 0");
        assert_eq!(registry().resolve(&cmd).unwrap(), "echo hello && exit 0");
        assert_eq!(cmd.label(), "shell");
    }

    #[test]
    fn test_typed_command_renders_flags() {
        let mut options = BTreeMap::new();
        options.insert("max_pages".to_string(), json!(5));
        options.insert("verbose".to_string(), json!(true));
        options.insert("quiet".to_string(), json!(false));
        options.insert("ticker".to_string(), json!(["AAPL", "MSFT"]));
        options.insert("since".to_string(), json!("last week"));

        let cmd = JobCommand::typed("transcripts", options);
        let line = registry().resolve(&cmd).unwrap();
        assert_eq!(
            line,
            "earnings-transcripts download --max-pages 5 --since 'last week' \
             --ticker AAPL --ticker MSFT --verbose"
        );
        assert_eq!(cmd.label(), "transcripts");
    }

    #[test]
    fn test_unknown_job_type() {
        let cmd = JobCommand::typed("weather", BTreeMap::new());
        assert!(matches!(
            registry().resolve(&cmd),
            Err(JobError::UnknownJobType(kind)) if kind == "weather"
        ));
    }

    #[test]
    fn test_invalid_option_key_rejected() {
        let mut options = BTreeMap::new();
        options.insert("bad key;rm".to_string(), json!("x"));
        let cmd = JobCommand::typed("sec", options);
        assert!(matches!(
            registry().check(&cmd),
            Err(JobError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("2024-06-01"), "2024-06-01");
    }

    #[test]
    fn test_job_validation() {
        let job = Job::shell("daily_transcripts", "true", Schedule::daily("02:00").unwrap());
        assert!(job.validate().is_ok());

        let job = Job::shell("bad name", "true", Schedule::daily("02:00").unwrap());
        assert!(matches!(job.validate(), Err(JobError::InvalidName(_))));

        let job = Job::shell(
            "c",
            "true",
            Schedule::Cron {
                expression: "nope".into(),
            },
        );
        assert!(matches!(job.validate(), Err(JobError::InvalidSchedule(_))));

        let job = Job::shell("t", "true", Schedule::once(None)).with_timeout(Duration::ZERO);
        assert!(matches!(job.validate(), Err(JobError::InvalidConfig(_))));
    }

    #[test]
    fn test_retry_policy_overrides() {
        let defaults = RetryPolicy::default();
        let job = Job::shell("j", "true", Schedule::once(None));
        assert_eq!(job.retry_policy(&defaults), defaults);

        let job = job
            .with_max_retries(1)
            .with_retry_delay(Duration::from_secs(2));
        let policy = job.retry_policy(&defaults);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.backoff, defaults.backoff);
    }

    #[test]
    fn test_job_serialization_round_trip() {
        let job = Job::shell("weekly_sec", "sec-dl", Schedule::weekly("mon", "06:00").unwrap())
            .with_max_retries(2)
            .with_description("SEC filings");
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_summary_from_job() {
        let job = Job::shell("j", "echo hi", Schedule::daily("02:00").unwrap()).with_enabled(false);
        let summary = JobSummary::from(&job);
        assert_eq!(summary.schedule, "daily at 02:00");
        assert_eq!(summary.command, "echo hi");
        assert!(!summary.enabled);
    }

    #[test]
    fn test_run_status_strings() {
        for status in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
