//! Testing utilities for users of the harvest library.
//!
//! This module provides helpers for testing scheduling behaviour without
//! real time or real processes:
//!
//! - [`ManualClock`]: A clock that only moves when told to
//! - [`ScriptedRunner`]: A command runner with scripted outcomes
//! - [`TestHarness`]: Wires a scheduler to in-memory storage, a manual clock
//!   and a scripted runner
//! - [`wait_until`]: Polls an async condition with a deadline

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::clock::Clock;
use crate::execution::{CommandOutput, CommandRunner, ExecutionError};
use crate::scheduler::Scheduler;
use crate::storage::InMemoryStorage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A clock whose time is set by the test.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use harvest::core::clock::Clock;
/// use harvest::testing::ManualClock;
///
/// let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap());
/// clock.advance(chrono::Duration::hours(1));
/// assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap());
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// One scripted attempt result.
#[derive(Debug, Clone)]
enum Step {
    Exit(i32),
    Timeout,
    LaunchError(String),
}

/// A fake [`CommandRunner`] that replays scripted outcomes.
///
/// Steps queued with `then_*` are consumed in order; once the queue is empty
/// every call exits with the default code (0 unless changed). Every call is
/// recorded.
///
/// # Example
///
/// ```
/// use harvest::testing::ScriptedRunner;
///
/// // Fails twice, then succeeds.
/// let runner = ScriptedRunner::new().then_exit(1).then_exit(1);
/// ```
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    default_exit: i32,
    delay: Option<Duration>,
    stdout: String,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedRunner {
    /// A runner where every call succeeds immediately.
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            default_exit: 0,
            delay: None,
            stdout: String::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Exit code used once the script is exhausted.
    pub fn with_default_exit(mut self, code: i32) -> Self {
        self.default_exit = code;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stdout returned by every call.
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Block every call until [`release`](Self::release) hands out a pass.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` blocked (or future) calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn then_exit(self, code: i32) -> Self {
        lock(&self.steps).push_back(Step::Exit(code));
        self
    }

    pub fn then_timeout(self) -> Self {
        lock(&self.steps).push_back(Step::Timeout);
        self
    }

    pub fn then_launch_error(self, message: impl Into<String>) -> Self {
        lock(&self.steps).push_back(Step::LaunchError(message.into()));
        self
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Commands received, in call order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Calls currently in progress.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls observed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active counter when a call ends, even if it is cancelled.
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        lock(&self.calls).push(command.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveCall(&self.active);

        if let Some(gate) = &self.gate {
            if let Ok(pass) = gate.acquire().await {
                pass.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = lock(&self.steps)
            .pop_front()
            .unwrap_or(Step::Exit(self.default_exit));
        match step {
            Step::Exit(code) => Ok(CommandOutput {
                exit_code: Some(code),
                stdout: self.stdout.clone(),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("exit {}", code)
                },
                duration: self.delay.unwrap_or_default(),
            }),
            Step::Timeout => Err(ExecutionError::TimedOut(limit)),
            Step::LaunchError(message) => Err(ExecutionError::Launch(message)),
        }
    }
}

/// Poll `condition` every 5ms until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A scheduler wired to in-memory storage, a manual clock and a scripted
/// runner, ticking every 10ms.
///
/// # Example
///
/// ```ignore
/// use harvest::testing::{ScriptedRunner, TestHarness};
///
/// let harness = TestHarness::new(start, ScriptedRunner::new());
/// harness.manager().add(job).await?;
/// let (handle, task) = harness.scheduler().start().await?;
/// harness.clock.advance(chrono::Duration::hours(1));
/// ```
pub struct TestHarness {
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub runner: Arc<ScriptedRunner>,
}

impl TestHarness {
    pub fn new(start: DateTime<Utc>, runner: ScriptedRunner) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            clock: Arc::new(ManualClock::new(start)),
            runner: Arc::new(runner),
        }
    }

    /// A scheduler sharing this harness's storage, clock and runner.
    ///
    /// Retries default to none; tests opt in per job.
    pub fn scheduler(&self) -> Scheduler<InMemoryStorage> {
        Scheduler::with_storage(Arc::clone(&self.storage))
            .with_runner(self.runner.clone())
            .with_clock(self.clock.clone())
            .with_retry_defaults(crate::core::retry::RetryPolicy::none())
            .with_tick_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    /// A job manager sharing this harness's storage and clock.
    pub fn manager(&self) -> crate::scheduler::JobManager<InMemoryStorage> {
        crate::scheduler::JobManager::new(Arc::clone(&self.storage)).with_clock(self.clock.clone())
    }
}
