//! # ReconcileTask: drives one entity toward one target version.
//!
//! A task is spawned by the [`Reconciler`](crate::Reconciler) when an
//! `entity-updated` assertion is admitted. It polls the entity through the
//! configured [`StatusProbe`] until the reported version equals the target,
//! the attempt budget is spent, or it is cancelled.
//!
//! ## Side effects per step
//! ```text
//! query fault        ──► [slot lock] registry.mark_degraded() + publish EntityDegraded
//! query ok           ──► [slot lock] registry.clear_degraded()
//! version == target  ──► [slot lock] record_convergence() + release slot
//!                        then publish Converged{duration}
//!                        and FleetConverged if every entity now shares the version
//! budget spent       ──► release slot, warn, publish ReconcileFailed
//! cancelled          ──► release slot (if still owned)
//! ```
//!
//! ## Rules
//! - The registry is written **only** while the task still owns its slot (same
//!   generation); a superseded task's late observations are ignored.
//! - The commit and the slot release happen under one lock, so a superseded or
//!   cancelled task can never overwrite its successor's result.
//! - Bus messages are published after every lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::engine::{Shared, Slot};
use super::probe::Observed;
use super::retry::{poll_until, Fault, PollOutcome, PollStep};
use super::stats::Counters;
use crate::error::ProbeError;
use crate::events::{Converged, EntityDegraded, FleetConverged, Message, ReconcileFailed};
use crate::registry::Entity;

/// How a reconciliation task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The entity reported the target version.
    Converged {
        /// Confirmed version.
        version: String,
        /// Polls made.
        attempts: u32,
        /// Time from admission to the matching poll.
        duration: Duration,
    },
    /// The attempt budget ran out.
    GaveUp {
        /// Polls made.
        attempts: u32,
        /// Last version the entity reported, if any poll succeeded.
        last_observed: Option<String>,
    },
    /// Cancelled, superseded or shut down.
    Cancelled {
        /// Polls made.
        attempts: u32,
    },
}

pub(crate) struct ReconcileTask {
    pub entity: Entity,
    pub target: String,
    pub generation: u64,
    pub shared: Arc<Shared>,
}

impl ReconcileTask {
    /// Runs until convergence, exhaustion or cancellation.
    pub async fn run(self, token: CancellationToken) -> TaskOutcome {
        let shared = Arc::clone(&self.shared);
        let probe = Arc::clone(&shared.probe);
        let entity = &self.entity;
        let target = self.target.as_str();
        let started = Instant::now();

        let outcome = poll_until(
            &shared.retry,
            &token,
            |attempt| {
                Counters::bump(&shared.stats.polls);
                tracing::debug!(entity = %entity.id, target, attempt, "querying status");
                probe.probe(entity)
            },
            |observed: &Observed| observed.version == target,
            |step| self.on_step(step),
        )
        .await;

        match outcome {
            PollOutcome::Matched { value, attempts } => {
                let duration = started.elapsed();
                match self.commit(&value, duration) {
                    Some((converged, fleet)) => {
                        Counters::bump(&shared.stats.converged);
                        tracing::info!(
                            entity = %entity.id,
                            version = %converged.version,
                            attempts,
                            duration_secs = converged.duration,
                            "converged"
                        );
                        shared.bus.publish(Message::Converged(converged));
                        if let Some(fleet) = fleet {
                            tracing::info!(version = %fleet.version, "all entities converged");
                            shared.bus.publish(Message::FleetConverged(fleet));
                        }
                        TaskOutcome::Converged {
                            version: value.version,
                            attempts,
                            duration,
                        }
                    }
                    None => self.cancelled(attempts),
                }
            }
            PollOutcome::Exhausted { attempts, last } => {
                if !self.release() {
                    return self.cancelled(attempts);
                }
                Counters::bump(&shared.stats.gave_up);
                let last_observed = last.map(|o| o.version);
                tracing::warn!(
                    entity = %entity.id,
                    target,
                    attempts,
                    last_observed = ?last_observed,
                    "gave up waiting for target version"
                );
                shared.bus.publish(Message::ReconcileFailed(ReconcileFailed {
                    entity_id: entity.id.clone(),
                    target_version: self.target.clone(),
                    attempts,
                    last_observed: last_observed.clone(),
                }));
                TaskOutcome::GaveUp {
                    attempts,
                    last_observed,
                }
            }
            PollOutcome::Cancelled { attempts } => {
                self.release();
                self.cancelled(attempts)
            }
        }
    }

    fn on_step(&self, step: PollStep<'_, Observed, ProbeError>) {
        let id = self.entity.id.as_str();
        match step {
            PollStep::Fault { attempt, fault } => {
                let err = match fault {
                    Fault::Query(e) => e.clone(),
                    Fault::TimedOut(timeout) => ProbeError::Timeout { timeout: *timeout },
                };
                let reason = err.to_string();
                let owned = self.while_owned(|| {
                    self.shared.registry.mark_degraded(id, &reason);
                });
                if owned.is_none() {
                    tracing::debug!(entity = id, attempt, error = %err, "fault after release ignored");
                    return;
                }
                Counters::bump(&self.shared.stats.faults);
                tracing::warn!(
                    entity = id,
                    attempt,
                    error = %err,
                    label = err.as_label(),
                    transient = err.is_transient(),
                    "status query failed"
                );
                self.shared
                    .bus
                    .publish(Message::EntityDegraded(EntityDegraded {
                        entity_id: id.to_string(),
                        attempt,
                        reason,
                    }));
            }
            PollStep::Observed {
                attempt,
                value,
                matched,
            } => {
                let recovered = self.while_owned(|| self.shared.registry.clear_degraded(id));
                if recovered == Some(true) {
                    tracing::info!(entity = id, attempt, "status endpoint recovered");
                }
                tracing::debug!(
                    entity = id,
                    attempt,
                    observed = %value.version,
                    target = %self.target,
                    matched,
                    "status observed"
                );
            }
            PollStep::Backoff { attempt, delay } => {
                tracing::debug!(
                    entity = id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "still waiting for target version"
                );
            }
        }
    }

    /// Writes the verified version and frees the slot, if the slot is still ours.
    ///
    /// Also reports the fleet as converged when this write is the one that made
    /// every entity agree on the version.
    fn commit(
        &self,
        observed: &Observed,
        duration: Duration,
    ) -> Option<(Converged, Option<FleetConverged>)> {
        let registry = &self.shared.registry;
        let mut slots = self.shared.slots.lock();
        if !self.owns(&slots) {
            return None;
        }

        let now = Utc::now();
        let previous = registry.get(&self.entity.id).and_then(|e| e.version);
        let updated = registry.record_convergence(
            &self.entity.id,
            &observed.version,
            observed.title.as_deref(),
            now,
        );
        slots.remove(&self.entity.id);
        let entity = updated?;

        let fleet = (previous.as_deref() != Some(observed.version.as_str()))
            .then(|| registry.uniform_version())
            .flatten()
            .filter(|v| *v == observed.version)
            .map(|version| FleetConverged {
                version,
                timestamp: now,
            });

        let converged = Converged {
            entity_id: entity.id,
            version: observed.version.clone(),
            timestamp: now,
            duration: duration.as_secs_f64(),
        };
        Some((converged, fleet))
    }

    /// Runs `f` under the slot lock if the slot is still ours.
    fn while_owned<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let slots = self.shared.slots.lock();
        self.owns(&slots).then(f)
    }

    /// Frees the slot if it is still ours. Returns `true` if it was.
    fn release(&self) -> bool {
        let mut slots = self.shared.slots.lock();
        if self.owns(&slots) {
            slots.remove(&self.entity.id);
            true
        } else {
            false
        }
    }

    fn owns(&self, slots: &HashMap<String, Slot>) -> bool {
        slots
            .get(&self.entity.id)
            .is_some_and(|slot| slot.generation == self.generation)
    }

    fn cancelled(&self, attempts: u32) -> TaskOutcome {
        Counters::bump(&self.shared.stats.cancelled);
        tracing::debug!(entity = %self.entity.id, target = %self.target, attempts, "reconcile cancelled");
        TaskOutcome::Cancelled { attempts }
    }
}
