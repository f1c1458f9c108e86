//! # Backoff between reconciliation polls.
//!
//! [`BackoffPolicy`] decides how long a reconciliation task sleeps after a poll
//! that did not observe the target version. Two shapes are common:
//! - **fixed**: every retry waits the same `first` delay (`factor = 1.0`);
//! - **exponential**: retry `n` waits `first × factor^n`, capped at `max`.
//!
//! The base delay is derived from the retry index alone, so jitter never feeds
//! back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use fleetwatch::BackoffPolicy;
//!
//! let fixed = BackoffPolicy::fixed(Duration::from_secs(10));
//! assert_eq!(fixed.delay_for(0), Duration::from_secs(10));
//! assert_eq!(fixed.delay_for(7), Duration::from_secs(10));
//!
//! let exp = BackoffPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(5));
//! assert_eq!(exp.delay_for(0), Duration::from_secs(1));
//! assert_eq!(exp.delay_for(2), Duration::from_secs(4));
//! assert_eq!(exp.delay_for(3), Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Delay schedule between polls.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth per retry (`1.0` = fixed).
    pub factor: f64,
    /// Randomization applied to the capped base delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Fixed 10s delay without jitter.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

impl BackoffPolicy {
    /// Same delay between every poll.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay grows by `factor` per retry, starting at `first`, capped at `max`.
    pub fn exponential(first: Duration, factor: f64, max: Duration) -> Self {
        Self {
            first,
            max,
            factor,
            jitter: JitterPolicy::None,
        }
    }

    /// Returns the policy with the given jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep before retry number `retry` (0-indexed).
    ///
    /// Non-finite or negative intermediate values collapse to `max`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if secs.is_finite() && secs >= 0.0 && secs <= self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        };
        self.jitter.apply(base)
    }
}
