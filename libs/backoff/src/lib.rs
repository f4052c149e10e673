//! Retry pacing primitives.
//!
//! This library provides the two pieces a supervisor needs to bound restarts
//! under failure:
//!
//! - [`BackoffPolicy`]: jittered exponential backoff with a cap. The delay
//!   for attempt `n` is `base × factor^n`, clamped to `max`. Jitter is
//!   additive-only and derived from the attempt number's base, never from a
//!   previous jittered result, so the underlying intervals are non-decreasing
//!   within a streak.
//! - [`RetryBudget`]: a bounded counter for one failure streak. Each failure
//!   consumes one unit and yields the next delay; exhaustion is terminal for
//!   the streak and must be surfaced, not retried silently.
//!
//! # Invariants
//!
//! - With `jitter = 0.0`, `delay(n) <= delay(n + 1)` up to the cap.
//! - `record_success` always resets the streak to its initial state.
//! - A budget of `max_attempts` permits exactly `max_attempts` failures
//!   before `BudgetExhausted`.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Terminal outcome of a failure streak: no retry attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry budget exhausted after {attempts} attempts")]
pub struct BudgetExhausted {
    /// Failures recorded in the streak, including the one that exhausted it.
    pub attempts: u32,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Multiplicative growth factor (`>= 1.0` for growing delays).
    pub factor: f64,

    /// Additive jitter fraction (0.0 to 1.0 of the base delay).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.factor.powi(exp);

        let clamped = if !raw.is_finite() || raw < 0.0 || raw > max {
            max
        } else {
            raw
        };

        // Additive-only jitter keeps the streak non-decreasing.
        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::rng();
            clamped + rng.random_range(0.0..=clamped * self.jitter)
        } else {
            clamped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Bounded retry budget for one failure streak.
///
/// A streak is a contiguous run of failures without an intervening success.
/// The budget owner calls [`RetryBudget::record_failure`] on each failure and
/// [`RetryBudget::record_success`] when the supervised resource recovers (or
/// when a new external input makes the old streak moot).
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempt: u32,
}

impl RetryBudget {
    /// Create a budget permitting `max_attempts` failures per streak.
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempt: 0,
        }
    }

    /// Record one failure.
    ///
    /// Returns the delay to wait before the next attempt, or
    /// [`BudgetExhausted`] once the streak has used up the budget.
    pub fn record_failure(&mut self) -> Result<Duration, BudgetExhausted> {
        if self.attempt >= self.max_attempts {
            return Err(BudgetExhausted {
                attempts: self.attempt,
            });
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Ok(delay)
    }

    /// Reset the streak after a success.
    pub fn record_success(&mut self) {
        self.attempt = 0;
    }

    /// Failures recorded in the current streak.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Attempts remaining before exhaustion.
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Whether the current streak has exhausted the budget.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
