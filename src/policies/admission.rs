//! # Per-entity admission policy
//!
//! The reconciler treats every entity as a **slot**: at any given time at most
//! one reconciliation task runs for it. When a second `entity-updated`
//! assertion arrives while the slot is busy, the admission policy decides what
//! to do with it.
//!
//! ## Variants
//! - `DropIfRunning`: the new assertion is a duplicate and is **ignored** until
//!   the running task terminates.
//! - `Replace`: if the new assertion is **strictly newer** (timestamp) and names a
//!   **different** target, the running task is cancelled and a fresh one starts.
//!   Anything else is still a duplicate.
//!
//! ## Invariants
//! - Tasks for the same entity never run in parallel.
//! - A superseded task can no longer write the registry once its successor is admitted.

use serde::Deserialize;

/// Policy controlling how assertions for a busy entity are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Ignore the new assertion while a task is active.
    ///
    /// Use when:
    /// - Notifications are re-delivered after reconnects
    /// - Several backends observe the same rollout independently
    #[default]
    DropIfRunning,

    /// Cancel the active task when a newer, different target arrives.
    ///
    /// Use when:
    /// - Deployments may be re-triggered before the fleet converges
    /// - Only the latest target version matters
    Replace,
}
