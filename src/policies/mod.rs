//! Retry, backoff and admission policies.
//!
//! This module groups the knobs that control **how long** a reconciliation
//! task waits between polls, **how many** polls it gets, and **what happens**
//! when a second assertion arrives for an entity that is already reconciling.
//!
//! ## Contents
//! - [`BackoffPolicy`]   how the delay between polls evolves (fixed or exponential, capped)
//! - [`JitterPolicy`]    randomization to keep a fleet of tasks from polling in lockstep
//! - [`RetryPolicy`]     attempt budget + backoff + per-poll timeout
//! - [`AdmissionPolicy`] duplicate suppression vs. supersede
//!
//! ## Quick wiring
//! ```text
//! Config { max_attempts, backoff, poll_timeout, admission }
//!      ├─► Reconciler::notify() uses admission to accept/drop/supersede
//!      └─► ReconcileTask uses RetryPolicy via reconcile::poll_until()
//!              - backoff.delay_for(retry) between polls
//!              - poll_timeout around each query
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → fixed 10s, no jitter.
//! - `RetryPolicy::default()` → 6 attempts, 5s per-poll timeout.
//! - `AdmissionPolicy::DropIfRunning`.

mod admission;
mod backoff;
mod jitter;
mod retry;

pub use admission::AdmissionPolicy;
pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use retry::RetryPolicy;
