//! External command execution.
//!
//! [`CommandRunner`] is the one seam between the scheduler and the tools it
//! drives: given a command line and a timeout, run it and report what
//! happened. [`ShellRunner`] is the production implementation and hands the
//! command line to `sh -c`.
//!
//! # Timeout Handling
//!
//! When the timeout expires the child is killed. On Unix the command runs in
//! its own process group and the whole group receives `SIGKILL`, so pipelines
//! and background helpers started by the command do not outlive it.
//!
//! ```no_run
//! use harvest::execution::{CommandRunner, ShellRunner};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), harvest::execution::ExecutionError> {
//! let runner = ShellRunner::new().env("EARNINGS_DATA_DIR", "/data");
//! let output = runner.execute("echo hello", Duration::from_secs(30)).await?;
//! assert!(output.success());
//! assert_eq!(output.stdout.trim(), "hello");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

/// Upper bound on captured stdout/stderr kept per attempt.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Errors that prevent a command from producing an exit status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The process could not be started.
    #[error("failed to launch command: {0}")]
    Launch(String),

    /// The process ran past its timeout and was killed.
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    /// Waiting on the process failed.
    #[error("I/O error while waiting for command: {0}")]
    Io(String),
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a command line to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute `command`, killing it if it runs longer than `limit`.
    async fn execute(&self, command: &str, limit: Duration)
    -> Result<CommandOutput, ExecutionError>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Use a different shell binary (must accept `-c`).
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run commands from this directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable to every command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn execute(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::Launch(e.to_string()))?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (stdout, stderr, status) =
                tokio::join!(read_tail(stdout), read_tail(stderr), child.wait());
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };
        let (stdout, stderr, status) = match timeout(limit, run).await {
            Ok(result) => result.map_err(|e| ExecutionError::Io(e.to_string()))?,
            Err(_) => {
                // The child itself is killed on drop; the rest of its group is not.
                kill_process_group(pid);
                return Err(ExecutionError::TimedOut(limit));
            }
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            duration: started.elapsed(),
        })
    }
}

/// The last [`MAX_CAPTURED_OUTPUT`] bytes of a stream.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    dropped: usize,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        if self.bytes.len() > MAX_CAPTURED_OUTPUT {
            let excess = self.bytes.len() - MAX_CAPTURED_OUTPUT;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    fn into_string(mut self) -> String {
        if self.dropped == 0 {
            return String::from_utf8_lossy(self.bytes.make_contiguous()).into_owned();
        }
        // Skip a character cut in half by the drop.
        while self.bytes.front().is_some_and(|b| b & 0xC0 == 0x80) {
            self.bytes.pop_front();
            self.dropped += 1;
        }
        format!(
            "[... truncated {} bytes]\n{}",
            self.dropped,
            String::from_utf8_lossy(self.bytes.make_contiguous())
        )
    }
}

/// Drain `reader` to EOF, keeping only the tail.
async fn read_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<TailBuffer> {
    let mut tail = TailBuffer::default();
    let Some(mut reader) = reader else {
        return Ok(tail);
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.push(&chunk[..n]);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) with a negative pid signals the process group; it
        // has no memory-safety preconditions.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Keep at most [`MAX_CAPTURED_OUTPUT`] bytes, preferring the tail.
pub fn truncate_output(output: String) -> String {
    if output.len() <= MAX_CAPTURED_OUTPUT {
        return output;
    }
    let mut start = output.len() - MAX_CAPTURED_OUTPUT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated {} bytes]\n{}", start, &output[start..])
}
