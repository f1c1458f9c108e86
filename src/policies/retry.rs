//! # Attempt budget for reconciliation.
//!
//! [`RetryPolicy`] bundles everything the poll loop needs to know about limits:
//! how many polls a task may make, how long to wait between them and how long a
//! single poll may take.
//!
//! ## Rules
//! - Every poll counts as one attempt, whether it observed a mismatching version
//!   or failed outright.
//! - The task gives up after exactly `max_attempts` unsuccessful polls, never more.
//! - No backoff sleep follows the final attempt.

use std::time::Duration;

use super::BackoffPolicy;

/// Bounded-retry parameters for one reconciliation task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Number of polls before giving up (clamped to at least 1).
    pub max_attempts: u32,
    /// Delay schedule between polls.
    pub backoff: BackoffPolicy,
    /// Upper bound for a single poll (`None` = unbounded).
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    /// 6 attempts, fixed 10s backoff, 5s per-poll timeout.
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff: BackoffPolicy::default(),
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl RetryPolicy {
    /// Returns the attempt budget, never below 1.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Returns the per-poll timeout, treating zero as unbounded.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.attempt_timeout.filter(|d| !d.is_zero())
    }
}
