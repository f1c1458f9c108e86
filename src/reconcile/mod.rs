//! Convergence reconciliation.
//!
//! An `entity-updated` assertion only *claims* that an entity should now run a
//! given version. This module verifies the claim against the entity itself.
//!
//! ## Contents
//! - [`StatusProbe`] / [`HttpProbe`]  one status query per call
//! - [`poll_until`]                    bounded poll-and-compare loop with backoff
//! - `ReconcileTask`                   one entity, one target, registry writes
//! - [`Reconciler`]                    per-entity slots, admission, shutdown
//! - [`ReconcileStats`]                counters

mod engine;
mod probe;
mod retry;
mod stats;
mod task;

pub use engine::{Admission, Reconciler};
pub use probe::{HttpProbe, Observed, StatusProbe};
pub use retry::{poll_until, Fault, PollOutcome, PollStep};
pub use stats::ReconcileStats;
pub use task::TaskOutcome;
