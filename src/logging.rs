//! Log file rotation and reading.
//!
//! With `logging.file` set, the scheduler writes through a rolling appender
//! that starts a new file every hour or day and prunes the oldest ones.
//! `harvest logs` reads the rotated files back, oldest first.

use crate::config::{ConfigError, LogRotation, LoggingConfig, expand_path};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// The set of files one configured log path rotates through.
///
/// `~/.earnings_data/logs/harvest.log` with daily rotation produces
/// `harvest.2024-06-01.log`, `harvest.2024-06-02.log` and so on in the same
/// directory. Without rotation the file keeps its configured name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFiles {
    dir: PathBuf,
    prefix: String,
    suffix: Option<String>,
}

impl LogFiles {
    /// The files for `config.file`, or `None` when logging goes to stderr.
    pub fn from_config(config: &LoggingConfig) -> Option<Self> {
        config.file.as_deref().map(|file| Self::new(expand_path(file)))
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let (prefix, suffix) = match path.file_name().map(Path::new) {
            Some(name) if name.extension().is_some() => (
                name.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                name.extension().map(|s| s.to_string_lossy().into_owned()),
            ),
            Some(name) => (name.to_string_lossy().into_owned(), None),
            None => ("harvest".to_string(), Some("log".to_string())),
        };
        Self {
            dir,
            prefix,
            suffix,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build the appender the subscriber writes through.
    ///
    /// `retention_days` of zero keeps every rotated file.
    pub fn appender(&self, config: &LoggingConfig) -> Result<RollingFileAppender, ConfigError> {
        let (rotation, files_per_day) = match config.rotation {
            LogRotation::Hourly => (Rotation::HOURLY, 24),
            LogRotation::Daily => (Rotation::DAILY, 1),
            LogRotation::Never => (Rotation::NEVER, 0),
        };

        let mut builder = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(self.prefix.clone());
        if let Some(suffix) = &self.suffix {
            builder = builder.filename_suffix(suffix.clone());
        }
        let keep = (config.retention_days as usize).saturating_mul(files_per_day);
        if keep > 0 {
            builder = builder.max_log_files(keep);
        }

        builder.build(&self.dir).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "logging.file: cannot write logs in {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Existing log files, oldest first.
    ///
    /// Rotated names embed the date, so name order is time order.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if self.matches(&entry.file_name().to_string_lossy()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn matches(&self, name: &str) -> bool {
        let Some(rest) = name.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        match &self.suffix {
            Some(suffix) => {
                let Some(middle) = rest.strip_suffix(suffix.as_str()) else {
                    return false;
                };
                middle == "." || (middle.starts_with('.') && middle.ends_with('.'))
            }
            None => rest.is_empty() || rest.starts_with('.'),
        }
    }
}

/// Filters for `harvest logs`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Keep lines mentioning this text, usually a job name.
    pub job: Option<String>,
    /// Keep lines logged at exactly this level.
    pub level: Option<Level>,
    /// Keep only the last N matching lines.
    pub tail: Option<usize>,
}

impl LogQuery {
    fn matches(&self, line: &str) -> bool {
        if let Some(job) = &self.job {
            if !line.contains(job.as_str()) {
                return false;
            }
        }
        match self.level {
            Some(level) => line_level(line) == Some(level),
            None => true,
        }
    }
}

/// Read `files` in order and return the lines matching `query`.
pub fn read_logs(files: &[PathBuf], query: &LogQuery) -> io::Result<Vec<String>> {
    let mut lines = VecDeque::new();
    for path in files {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if !query.matches(&line) {
                continue;
            }
            if query.tail == Some(0) {
                continue;
            }
            if let Some(tail) = query.tail {
                if lines.len() == tail {
                    lines.pop_front();
                }
            }
            lines.push_back(line);
        }
    }
    Ok(lines.into())
}

/// The level of one formatted log line, in either output format.
pub fn line_level(line: &str) -> Option<Level> {
    let line = line.trim_start();
    if line.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        return value.get("level")?.as_str()?.parse().ok();
    }
    // "<timestamp>  INFO target: message"
    let token = line.split_whitespace().nth(1)?;
    if token.chars().all(|c| c.is_ascii_alphabetic()) {
        token.parse().ok()
    } else {
        None
    }
}
