//! Retry policy and backoff delay computation.
//!
//! Pure calculation, no I/O. The delay function takes the backoff fields
//! separately rather than a whole policy because the task row's snapshotted
//! `backoff_strategy`/`backoff_base_ms` are authoritative for in-flight
//! tasks, while clamp and jitter come from the step's policy object.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KonduitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "backoff_strategy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits `base_delay_ms`.
    #[default]
    Fixed,
    /// Retry `n` waits `base_delay_ms * n`.
    Linear,
    /// Retry `n` waits `base_delay_ms * 2^(n-1)`.
    Exponential,
}

/// Per-step retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget, counting the first execution. At least 1.
    pub max_attempts: i32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: i64,
    /// Upper bound applied after jitter.
    pub max_delay_ms: i64,
    /// Replace the computed delay with a uniform value in `[0, delay)`.
    /// Only meaningful combined with `Exponential`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Construct a validated policy.
    pub fn new(
        max_attempts: i32,
        strategy: BackoffStrategy,
        base_delay_ms: i64,
        max_delay_ms: i64,
        jitter: bool,
    ) -> Result<Self> {
        let policy = Self {
            max_attempts,
            strategy,
            base_delay_ms,
            max_delay_ms,
            jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(KonduitError::InvalidRetryPolicy(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if self.base_delay_ms < 0 {
            return Err(KonduitError::InvalidRetryPolicy(format!(
                "base_delay_ms must be non-negative, got {}",
                self.base_delay_ms
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(KonduitError::InvalidRetryPolicy(format!(
                "max_delay_ms ({}) must be at least base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Whether another attempt remains after `current_attempt` failed.
    pub fn should_retry(&self, current_attempt: i32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Delay before retrying after the given 1-based attempt failed.
    pub fn delay_for(&self, attempt: i32, rng: &mut fastrand::Rng) -> Result<Duration> {
        compute_delay(
            self.strategy,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter,
            attempt,
            rng,
        )
    }
}

/// Compute the backoff delay for a 1-based attempt number.
///
/// The growth formulas run in floating point so large attempt numbers
/// saturate instead of overflowing, then the result is cast back to whole
/// milliseconds. Jitter draws uniformly from `[0, delay)`; the clamp to
/// `max_delay_ms` happens after jitter.
pub fn compute_delay(
    strategy: BackoffStrategy,
    base_delay_ms: i64,
    max_delay_ms: i64,
    jitter: bool,
    attempt: i32,
    rng: &mut fastrand::Rng,
) -> Result<Duration> {
    if attempt < 1 {
        return Err(KonduitError::InvalidRetryPolicy(format!(
            "attempt number must be at least 1, got {attempt}"
        )));
    }

    let raw = match strategy {
        BackoffStrategy::Fixed => base_delay_ms as f64,
        BackoffStrategy::Linear => base_delay_ms as f64 * attempt as f64,
        BackoffStrategy::Exponential => base_delay_ms as f64 * 2f64.powi(attempt - 1),
    };
    let computed = if raw >= i64::MAX as f64 {
        i64::MAX
    } else {
        raw as i64
    };

    let jittered = if jitter && computed > 0 {
        rng.i64(0..computed)
    } else {
        computed
    };

    let clamped = jittered.clamp(0, max_delay_ms);
    Ok(Duration::from_millis(clamped as u64))
}
