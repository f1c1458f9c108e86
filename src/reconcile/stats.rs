//! Reconciliation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the reconciler counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Notifications that started a task.
    pub admitted: u64,
    /// Notifications dropped because a task was already active.
    pub duplicates: u64,
    /// Tasks cancelled in favour of a newer assertion.
    pub superseded: u64,
    /// Notifications naming an entity the registry does not know.
    pub unknown: u64,
    /// Tasks that confirmed their target.
    pub converged: u64,
    /// Tasks that spent their attempt budget.
    pub gave_up: u64,
    /// Tasks stopped by cancellation.
    pub cancelled: u64,
    /// Status queries issued.
    pub polls: u64,
    /// Status queries that failed.
    pub faults: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub admitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub superseded: AtomicU64,
    pub unknown: AtomicU64,
    pub converged: AtomicU64,
    pub gave_up: AtomicU64,
    pub cancelled: AtomicU64,
    pub polls: AtomicU64,
    pub faults: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconcileStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReconcileStats {
            admitted: get(&self.admitted),
            duplicates: get(&self.duplicates),
            superseded: get(&self.superseded),
            unknown: get(&self.unknown),
            converged: get(&self.converged),
            gave_up: get(&self.gave_up),
            cancelled: get(&self.cancelled),
            polls: get(&self.polls),
            faults: get(&self.faults),
        }
    }
}
