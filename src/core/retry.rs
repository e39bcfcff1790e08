//! Retry policy configuration for jobs.
//!
//! A failed attempt is retried up to `max_retries` times. The wait before each
//! retry grows according to the configured [`Backoff`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries, not including the initial attempt (0 = no retries).
    /// `max_retries = 3` means up to 4 attempts in total.
    pub max_retries: u32,

    /// Base delay between attempts.
    #[serde(with = "serde_duration")]
    pub delay: Duration,

    /// How the delay grows with each retry.
    #[serde(default)]
    pub backoff: Backoff,

    /// Condition for when to retry.
    #[serde(default)]
    pub retry_on: RetryCondition,
}

/// Growth of the retry delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits `delay`.
    Fixed,
    /// Retry `n` waits `delay * n`.
    #[default]
    Linear,
    /// Retry `n` waits `delay * multiplier^(n-1)`.
    Exponential { multiplier: f64 },
}

/// Conditions under which a job should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any failure.
    #[default]
    Always,

    /// Retry only on transient failures (timeouts, launch errors).
    TransientOnly,

    /// Never retry, regardless of max_retries.
    Never,
}

/// Upper bound on a single backoff wait.
const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy with fixed delay retries.
    ///
    /// # Arguments
    /// * `max_retries` - Maximum retries (not including initial try)
    /// * `delay` - Fixed delay between retries
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            backoff: Backoff::Fixed,
            retry_on: RetryCondition::Always,
        }
    }

    /// Create a policy whose delay grows linearly with the retry number.
    pub fn linear(max_retries: u32, delay: Duration) -> Self {
        Self {
            backoff: Backoff::Linear,
            ..Self::fixed(max_retries, delay)
        }
    }

    /// Builder: set the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        if self.retry_on == RetryCondition::Never {
            1
        } else {
            self.max_retries.saturating_add(1)
        }
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0 && self.retry_on != RetryCondition::Never
    }

    /// Check if we should retry after a failed attempt.
    ///
    /// # Arguments
    /// * `attempts` - Number of attempts already made (including failed ones)
    /// * `transient` - Whether the last failure was a timeout or launch error
    pub fn should_retry(&self, attempts: u32, transient: bool) -> bool {
        match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::TransientOnly if !transient => false,
            _ => attempts <= self.max_retries,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(retry),
            Backoff::Exponential { multiplier } => {
                // Multipliers below 1 would shrink the delay.
                let factor = multiplier.max(1.0).powi(retry as i32 - 1);
                Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(MAX_DELAY)
            }
        };
        delay.min(MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    /// Three retries, 15 minutes apart, growing linearly.
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(15 * 60))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as seconds (matching YAML config format).
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as [`serde_duration`], for optional fields.
pub(crate) mod serde_opt_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
