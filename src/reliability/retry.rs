//! Retry policy: constant, linear and exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The named backoff kinds a `try.retry.delay` clause may select.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits the same interval.
    Constant,
    /// The `n`th retry waits `n * initial_interval`.
    Linear,
    /// The `n`th retry waits `initial_interval * coefficient^(n-1)`, capped
    /// at `max_interval`.
    Exponential,
}

/// Retry configuration for a `try` task's `retry` clause, and for the
/// outbox scheduler's own redelivery of a failed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,

    /// Which backoff shape to apply.
    pub backoff: Backoff,

    /// Delay before the first retry (also the fixed delay under `Constant`
    /// and the per-attempt increment under `Linear`).
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on any computed delay.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier, only meaningful under `Exponential`.
    pub backoff_coefficient: f64,

    /// Jitter factor in `0.0..=1.0`; a value of `0.1` means plus-or-minus 10%.
    pub jitter: f64,

    /// Error types (matched against `WorkflowError.kind`) that must not be
    /// retried even though attempts remain.
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 5 attempts, 1s initial
    /// interval, 60s cap, 2x coefficient, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Linear backoff: the nth retry waits `n * interval`.
    pub fn linear(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear,
            initial_interval: interval,
            max_interval: Duration::MAX,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Constant backoff: every retry waits the same interval.
    pub fn constant(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Constant,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay before the given attempt (1-based; attempt 1 is the initial
    /// try and always returns zero).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;

        let base = match self.backoff {
            Backoff::Constant => self.initial_interval.as_secs_f64(),
            Backoff::Linear => self.initial_interval.as_secs_f64() * retry_num as f64,
            Backoff::Exponential => {
                self.initial_interval.as_secs_f64()
                    * self.backoff_coefficient.powi(retry_num as i32 - 1)
            }
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether an error of this type (a `WorkflowError.kind` string such as
    /// `"communication"`) should be retried at all.
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.contains(&error_type.to_string()),
            None => true,
        }
    }

    /// Whether another attempt remains after `current_attempt`.
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
