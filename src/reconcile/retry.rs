//! # Bounded poll-and-compare primitive.
//!
//! [`poll_until`] is the loop every reconciliation task runs, factored out so it
//! can be reused (and tested) without an entity, a bus or a network:
//!
//! ```text
//! loop {
//!   ├─► cancelled? ──► Cancelled
//!   ├─► attempt += 1
//!   ├─► query(attempt) under per-poll timeout (cancellable)
//!   │       ├─ Err / timeout ──► observe(Fault)
//!   │       └─ Ok(value)      ──► observe(Observed { matched })
//!   │                              └─ matched ──► Matched
//!   ├─► attempt == max_attempts ──► Exhausted
//!   ├─► observe(Backoff { delay })
//!   └─► sleep(delay) (cancellable)
//! }
//! ```
//!
//! ## Rules
//! - A fault and a mismatch both consume one attempt.
//! - Exactly `max_attempts` queries run before `Exhausted`, never more.
//! - No sleep follows the final attempt.
//! - Cancellation is observed before each attempt, while a query is in flight
//!   and during the backoff sleep.

use std::future::Future;
use std::time::Duration;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::policies::RetryPolicy;

/// Why a single query produced no value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault<E> {
    /// The query itself returned an error.
    Query(E),
    /// The query did not finish within the per-poll timeout.
    TimedOut(Duration),
}

/// Progress report handed to the `observe` callback.
#[derive(Debug)]
pub enum PollStep<'a, T, E> {
    /// Attempt `attempt` failed.
    Fault {
        /// 1-based attempt number.
        attempt: u32,
        /// What went wrong.
        fault: &'a Fault<E>,
    },
    /// Attempt `attempt` returned a value.
    Observed {
        /// 1-based attempt number.
        attempt: u32,
        /// Returned value.
        value: &'a T,
        /// Result of `compare`.
        matched: bool,
    },
    /// The loop is about to sleep before attempt `attempt + 1`.
    Backoff {
        /// Attempt that just finished.
        attempt: u32,
        /// Sleep duration.
        delay: Duration,
    },
}

/// How a [`poll_until`] run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// `compare` accepted a value.
    Matched {
        /// The accepted value.
        value: T,
        /// Queries made, including the matching one.
        attempts: u32,
    },
    /// The attempt budget ran out.
    Exhausted {
        /// Queries made (equals the budget).
        attempts: u32,
        /// Last value returned by a successful query, if any.
        last: Option<T>,
    },
    /// The token was cancelled.
    Cancelled {
        /// Queries started before cancellation.
        attempts: u32,
    },
}

/// Runs `query` until `compare` accepts its value, the budget in `policy` is
/// spent, or `token` is cancelled.
pub async fn poll_until<T, E, Q, Fut, C, O>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut query: Q,
    compare: C,
    mut observe: O,
) -> PollOutcome<T>
where
    Q: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&T) -> bool,
    O: FnMut(PollStep<'_, T, E>),
{
    let max_attempts = policy.attempts();
    let timeout = policy.timeout();
    let mut last: Option<T> = None;
    let mut attempt: u32 = 0;

    loop {
        if token.is_cancelled() {
            return PollOutcome::Cancelled { attempts: attempt };
        }
        attempt += 1;

        let res = select! {
            biased;
            _ = token.cancelled() => return PollOutcome::Cancelled { attempts: attempt },
            res = run_query(query(attempt), timeout) => res,
        };

        match res {
            Ok(value) => {
                let matched = compare(&value);
                observe(PollStep::Observed {
                    attempt,
                    value: &value,
                    matched,
                });
                if matched {
                    return PollOutcome::Matched {
                        value,
                        attempts: attempt,
                    };
                }
                last = Some(value);
            }
            Err(fault) => observe(PollStep::Fault {
                attempt,
                fault: &fault,
            }),
        }

        if attempt >= max_attempts {
            return PollOutcome::Exhausted {
                attempts: attempt,
                last,
            };
        }

        let delay = policy.backoff.delay_for(attempt - 1);
        observe(PollStep::Backoff { attempt, delay });

        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        select! {
            _ = &mut sleep => {}
            _ = token.cancelled() => return PollOutcome::Cancelled { attempts: attempt },
        }
    }
}

async fn run_query<T, E, F>(fut: F, timeout: Option<Duration>) -> Result<T, Fault<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(dur) => match time::timeout(dur, fut).await {
            Ok(res) => res.map_err(Fault::Query),
            Err(_elapsed) => Err(Fault::TimedOut(dur)),
        },
        None => fut.await.map_err(Fault::Query),
    }
}
