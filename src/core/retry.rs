//! core::retry
//!
//! Bounded retry policy shared by the lock manager and the remote state
//! manager.
//!
//! # Design
//!
//! A [`RetryPolicy`] is a plain value: maximum attempts, an initial
//! interval, a cap, and a backoff shape. Whether an error is worth another
//! attempt is decided by a classifier passed alongside the operation, so the
//! same policy serves store errors (transient vs permanent) and lock
//! contention (always retried until the budget is spent).
//!
//! # Example
//!
//! ```
//! use stackguard::core::retry::{Backoff, Retry, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let policy = RetryPolicy::new(3, Duration::from_millis(1), Backoff::Fixed);
//! let mut calls = 0;
//! let result: Result<u32, &str> = policy
//!     .run(
//!         || {
//!             calls += 1;
//!             let attempt = calls;
//!             async move { if attempt < 3 { Err("busy") } else { Ok(attempt) } }
//!         },
//!         |_| Retry::Transient,
//!     )
//!     .await;
//! assert_eq!(result, Ok(3));
//! # });
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of attempts for remote store calls.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first backoff interval for remote store calls.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);

/// Default ceiling for exponential backoff.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Worth another attempt (throttling, contention, eventual consistency).
    Transient,
    /// Fail immediately (permission denied, malformed request).
    Permanent,
}

/// Shape of the wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same interval every time.
    Fixed,
    /// Interval doubles after each attempt, capped at `max_interval`.
    #[default]
    Exponential,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound on any single wait.
    pub max_interval: Duration,
    /// How the wait grows.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempts, interval and backoff.
    ///
    /// `max_interval` is set to the larger of `interval` and
    /// [`DEFAULT_MAX_INTERVAL`].
    pub fn new(max_attempts: u32, interval: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval.max(DEFAULT_MAX_INTERVAL),
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Backoff::Fixed)
    }

    /// Policy for lock contention: `max_retries` extra attempts spaced by a
    /// fixed `interval`.
    pub fn for_lock_contention(max_retries: u32, interval: Duration) -> Self {
        Self::new(max_retries.saturating_add(1), interval, Backoff::Fixed)
    }

    /// Wait before attempt number `attempt + 1` (attempts are 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_interval,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.initial_interval
                    .saturating_mul(factor)
                    .min(self.max_interval)
            }
        }
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }

    /// Run `op` until it succeeds, `classify` calls an error permanent, or
    /// the attempt budget is spent. Returns the last error on failure.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Retry,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || classify(&err) == Retry::Permanent {
                        return Err(err);
                    }
                    let delay = self.delay_after(attempt);
                    debug!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Backoff::Fixed)
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let calls = Cell::new(0);
        let result: Result<&str, &str> = fast(3)
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Ok("done") }
                },
                |_| Retry::Transient,
            )
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_budget() {
        let calls = Cell::new(0);
        let result: Result<(), &str> = fast(4)
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Err("throttled") }
                },
                |_| Retry::Transient,
            )
            .await;
        assert_eq!(result, Err("throttled"));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), &str> = fast(10)
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Err("access denied") }
                },
                |_| Retry::Permanent,
            )
            .await;
        assert_eq!(result, Err("access denied"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let mut policy = fast(1);
        policy.max_attempts = 0;
        let calls = Cell::new(0);
        let _: Result<(), &str> = policy
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Err("x") }
                },
                |_| Retry::Transient,
            )
            .await;
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(500),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(30), Duration::from_millis(500));
    }

    #[test]
    fn lock_contention_policy_is_fixed() {
        let policy = RetryPolicy::for_lock_contention(3, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.max_total_delay(), Duration::from_secs(6));
    }

    #[test]
    fn no_retry_has_no_delay() {
        assert_eq!(RetryPolicy::no_retry().max_total_delay(), Duration::ZERO);
    }
}
