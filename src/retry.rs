//! Retry policy for transient stage failures.
//!
//! Backoff is exponential with doubling from a base delay, optionally capped.
//! Delays between consecutive attempts are therefore non-decreasing, which
//! the engine relies on when racing backoff sleeps against cancellation.

use std::time::Duration;

/// Per-stage rule governing retry attempts and backoff for retryable failures.
///
/// `max_attempts` counts every invocation including the first: a policy with
/// `max_attempts = 3` runs the stage at most three times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and base backoff delay.
    ///
    /// `max_attempts` is clamped to at least 1; a stage always runs once.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    /// Caps the computed backoff delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// A policy that never retries: one attempt, no backoff.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Maximum number of invocations, first attempt included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay before the second attempt.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Whether another attempt is allowed after `attempt` failures.
    ///
    /// `attempt` is 1-based: pass the number of the attempt that just failed.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay to wait after the 1-based `attempt` fails.
    ///
    /// Doubles per failed attempt: `base`, `2*base`, `4*base`, …, saturating
    /// at the configured cap when one is set.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts with a two-second base delay.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}
