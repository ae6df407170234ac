//! Retry ceilings and the backoff between attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::JobError;

/// How long to wait before the next attempt.
///
/// Attempts are 0-indexed: `delay_for_attempt(0)` is the pause after the
/// first failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffStrategy {
    /// Requeue with no delay
    None,
    /// Same delay every time
    Fixed { delay_secs: u64 },
    /// `initial + increment * attempt`
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// `initial * multiplier^attempt`, capped
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
    /// Exponential, then spread by `+/- jitter_factor` of the delay
    ExponentialWithJitter {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    pub fn linear(initial_delay_secs: u64, increment_secs: u64) -> Self {
        Self::Linear {
            initial_delay_secs,
            increment_secs,
        }
    }

    pub fn exponential() -> Self {
        Self::default()
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_secs } => Duration::from_secs(delay_secs),
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => Duration::from_secs(
                initial_delay_secs.saturating_add(increment_secs.saturating_mul(u64::from(attempt))),
            ),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => seconds(grow(initial_delay_secs, multiplier, attempt, max_delay_secs)),
            Self::ExponentialWithJitter {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
                jitter_factor,
            } => {
                let base = grow(initial_delay_secs, multiplier, attempt, max_delay_secs);
                let spread = base * jitter_factor.clamp(0.0, 1.0);
                seconds((base + spread * (unit_random() * 2.0 - 1.0)).max(1.0))
            }
        }
    }
}

fn grow(initial_secs: u64, multiplier: f64, attempt: u32, cap_secs: u64) -> f64 {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    (initial_secs as f64 * multiplier.powi(exponent)).min(cap_secs as f64)
}

fn seconds(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Uniform value in `[0, 1)` taken from a v4 UUID's random bits.
fn unit_random() -> f64 {
    let bits = (Uuid::new_v4().as_u128() >> 75) as u64;
    bits as f64 / (1u64 << 53) as f64
}

/// Retry ceiling and backoff for failed jobs.
///
/// A job may override the worker's policy through
/// [`Job::retry_policy`](super::Job::retry_policy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-queues allowed after the first failure (0 = fail on first error)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Also retry errors created with [`JobError::fatal`]
    pub retry_on_any_error: bool,
    /// No retries once this many seconds have passed since enqueue
    pub max_retry_duration_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_retries(3)
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::with_retries(0)
    }

    pub fn with_retries(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::default(),
            retry_on_any_error: false,
            max_retry_duration_secs: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a job that has already been re-queued `retries_spent` times
    /// should be re-queued again after `error`.
    pub fn should_retry(
        &self,
        retries_spent: u32,
        error: &JobError,
        enqueued_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let below_ceiling = retries_spent < self.max_attempts;
        let retryable = error.retryable || self.retry_on_any_error;
        let within_window = self.max_retry_duration_secs.map_or(true, |limit| {
            let elapsed = now.signed_duration_since(enqueued_at).num_seconds();
            elapsed < i64::try_from(limit).unwrap_or(i64::MAX)
        });

        below_ceiling && retryable && within_window
    }

    pub fn next_retry_delay(&self, retries_spent: u32) -> Duration {
        self.backoff.delay_for_attempt(retries_spent)
    }
}
