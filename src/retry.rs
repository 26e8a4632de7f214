//! Retry policy for transient failures.
//!
//! Delays grow exponentially from `initial_backoff`, are capped at
//! `max_backoff`, and carry up to `jitter` (as a fraction) of random extra
//! time. A [`Backoff`] never yields a delay shorter than the one before it.

use std::time::Duration;

use rand::Rng;

/// Classifies errors into retryable and final.
pub trait Retryable {
    /// Whether retrying the same operation may succeed.
    fn is_transient(&self) -> bool;
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_backoff: Duration,
    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Start a fresh delay sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
            last: Duration::ZERO,
        }
    }

    /// Attempts permitted, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Iterator-like delay sequence for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
    last: Duration,
}

impl Backoff {
    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = exponential(&self.policy, self.retries);
        self.retries = self.retries.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 && !base.is_zero() {
            base.mul_f64(rand::thread_rng().gen_range(0.0..=jitter))
        } else {
            Duration::ZERO
        };

        let delay = base.saturating_add(extra).max(self.last);
        self.last = delay;
        delay
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

fn exponential(policy: &RetryPolicy, retries: u32) -> Duration {
    let factor = 2u32.checked_pow(retries).unwrap_or(u32::MAX);
    policy
        .initial_backoff
        .checked_mul(factor)
        .unwrap_or(policy.max_backoff)
        .min(policy.max_backoff)
}
