// src/core/retry.rs

//! A bounded retry-with-backoff policy shared by the service stop and unmount paths.

use std::time::Duration;

/// Describes how many times an operation may be attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// The delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// The delay never grows beyond this value.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy with a constant delay between attempts.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: backoff,
            max_backoff: backoff,
        }
    }

    /// A policy whose delay doubles after every failed attempt, capped at `max_backoff`.
    pub fn exponential(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// The attempt numbers this policy allows, starting at 1.
    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// The delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Sleeps for the backoff that follows `attempt`, unless it was the last one.
    pub async fn backoff(&self, attempt: u32) {
        if !self.is_last(attempt) {
            tokio::time::sleep(self.delay_after(attempt)).await;
        }
    }
}
