//! # Reconciler: admission and lifecycle of per-entity reconciliation tasks.
//!
//! The reconciler listens on the `entity-updated` topic and keeps one **slot**
//! per entity. A slot holds the handle of the single task allowed to reconcile
//! that entity.
//!
//! ## Architecture
//! ```text
//! Bus("entity-updated") ──► UpdateListener ──► Reconciler::notify(update)
//!                                                   │ [slots lock]
//!                      ┌────────────────────────────┼──────────────────────────┐
//!                      ▼                            ▼                          ▼
//!              unknown entity               slot busy                      slot free
//!              (warn, drop)        ├─ DropIfRunning ─► Duplicate         spawn task
//!                                  └─ Replace + newer + other target        ▼
//!                                        ─► cancel old, spawn new     ReconcileTask::run()
//!                                                                           │
//!                         Converged / GaveUp / Cancelled ◄──────────────────┘
//!                         (task frees its own slot)
//! ```
//!
//! ## Rules
//! - **At most one active task per entity.** The "is a task active" check and
//!   the slot insertion happen under one mutex, so concurrent notifications
//!   cannot both start a task.
//! - Each admitted task gets a fresh **generation**; only the task whose
//!   generation matches the slot may write the registry.
//! - Tasks for different entities run concurrently and never share state
//!   beyond their own registry record.
//! - `shutdown` stops admission, cancels every task and waits up to `grace`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::probe::StatusProbe;
use super::stats::{Counters, ReconcileStats};
use super::task::{ReconcileTask, TaskOutcome};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, EntityUpdated, Message, Subscribe, SubscriptionId, Topic};
use crate::policies::{AdmissionPolicy, RetryPolicy};
use crate::registry::{Entity, EntityRegistry};

/// Result of offering an assertion to the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A new task was started.
    Started,
    /// A task is already active; the assertion was ignored.
    Duplicate {
        /// Target of the task that keeps running.
        active_target: String,
    },
    /// The active task was cancelled and a new one started.
    Superseded {
        /// Target of the cancelled task.
        previous_target: String,
    },
    /// The entity is not in the registry; the assertion was dropped.
    UnknownEntity,
    /// The reconciler is shutting down.
    ShuttingDown,
}

/// Handle to the single active task of one entity.
pub(crate) struct Slot {
    pub generation: u64,
    target: String,
    asserted_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl Slot {
    /// True if `update` is strictly newer than this slot's assertion and names another target.
    fn superseded_by(&self, update: &EntityUpdated) -> bool {
        let newer = match (update.timestamp, self.asserted_at) {
            (Some(new), Some(current)) => new > current,
            (Some(_), None) => true,
            (None, _) => false,
        };
        newer && update.target_version != self.target
    }
}

/// State shared by the reconciler handle, its bus listener and its tasks.
pub(crate) struct Shared {
    pub bus: Bus,
    pub registry: EntityRegistry,
    pub probe: Arc<dyn StatusProbe>,
    pub retry: RetryPolicy,
    pub slots: Mutex<HashMap<String, Slot>>,
    pub stats: Counters,
    admission: AdmissionPolicy,
    next_generation: AtomicU64,
    runtime: Handle,
    token: CancellationToken,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Per-entity reconciliation engine.
///
/// Cheap to clone; clones drive the same set of tasks.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl Reconciler {
    /// Creates a reconciler and subscribes it to `entity-updated` on `bus`.
    ///
    /// Must be called from within a Tokio runtime; tasks are spawned on it.
    pub fn new(
        bus: Bus,
        registry: EntityRegistry,
        probe: Arc<dyn StatusProbe>,
        cfg: &Config,
    ) -> Result<Self, RuntimeError> {
        let runtime = Handle::try_current().map_err(|_| RuntimeError::NoRuntime)?;
        let shared = Arc::new(Shared {
            bus: bus.clone(),
            registry,
            probe,
            retry: cfg.retry_policy(),
            slots: Mutex::new(HashMap::new()),
            stats: Counters::default(),
            admission: cfg.admission,
            next_generation: AtomicU64::new(0),
            runtime,
            token: CancellationToken::new(),
            subscription: Mutex::new(None),
        });

        let listener = Arc::new(UpdateListener {
            shared: Arc::downgrade(&shared),
        });
        let id = bus.subscribe(Topic::EntityUpdated, listener);
        *shared.subscription.lock() = Some(id);

        Ok(Self { shared })
    }

    /// Offers an assertion. Never blocks on I/O.
    pub fn notify(&self, update: &EntityUpdated) -> Admission {
        let shared = &self.shared;
        if shared.token.is_cancelled() {
            return Admission::ShuttingDown;
        }
        let id = update.entity_id.as_str();

        let mut slots = shared.slots.lock();
        let Some(entity) = shared.registry.get(id) else {
            Counters::bump(&shared.stats.unknown);
            tracing::warn!(entity = id, target = %update.target_version, "assertion for unknown entity dropped");
            return Admission::UnknownEntity;
        };

        let admission = match slots.get(id) {
            None => Admission::Started,
            Some(active)
                if shared.admission == AdmissionPolicy::Replace && active.superseded_by(update) =>
            {
                Admission::Superseded {
                    previous_target: active.target.clone(),
                }
            }
            Some(active) => {
                Counters::bump(&shared.stats.duplicates);
                tracing::debug!(
                    entity = id,
                    target = %update.target_version,
                    active_target = %active.target,
                    "reconcile already active, assertion ignored"
                );
                return Admission::Duplicate {
                    active_target: active.target.clone(),
                };
            }
        };

        if let Some(previous) = slots.remove(id) {
            previous.cancel.cancel();
            Counters::bump(&shared.stats.superseded);
            tracing::info!(
                entity = id,
                previous_target = %previous.target,
                target = %update.target_version,
                "reconcile superseded by newer assertion"
            );
        }

        let slot = self.spawn_task(entity, update);
        tracing::info!(
            entity = id,
            target = %update.target_version,
            generation = slot.generation,
            "reconcile started"
        );
        slots.insert(id.to_string(), slot);
        Counters::bump(&shared.stats.admitted);
        admission
    }

    /// Cancels the active task of `id`. Returns `false` if none was active.
    ///
    /// The registry keeps the entity's last confirmed state.
    pub fn cancel(&self, id: &str) -> bool {
        let slot = self.shared.slots.lock().remove(id);
        match slot {
            Some(slot) => {
                slot.cancel.cancel();
                tracing::info!(entity = id, target = %slot.target, "reconcile cancelled");
                true
            }
            None => false,
        }
    }

    /// True if a task is reconciling `id`.
    pub fn is_active(&self, id: &str) -> bool {
        self.shared.slots.lock().contains_key(id)
    }

    /// Target version of the active task of `id`, if any.
    pub fn active_target(&self, id: &str) -> Option<String> {
        self.shared.slots.lock().get(id).map(|s| s.target.clone())
    }

    /// Ids of entities with an active task, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.slots.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReconcileStats {
        self.shared.stats.snapshot()
    }

    /// Stops admission, cancels every task and waits up to `grace` for them.
    ///
    /// Returns [`RuntimeError::GraceExceeded`] listing the entities whose task
    /// was still running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), RuntimeError> {
        let shared = &self.shared;
        if let Some(id) = shared.subscription.lock().take() {
            shared.bus.unsubscribe(id);
        }
        shared.token.cancel();

        let mut handles: Vec<(String, JoinHandle<TaskOutcome>)> = {
            let mut slots = shared.slots.lock();
            slots.drain().map(|(id, slot)| (id, slot.join)).collect()
        };
        handles.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let done = async {
            for (id, join) in handles.iter_mut() {
                if let Err(err) = join.await {
                    tracing::error!(entity = %id, error = %err, "reconcile task panicked");
                }
            }
        };
        let res = tokio::time::timeout(grace, done).await;

        match res {
            Ok(()) => Ok(()),
            Err(_) => {
                let stuck: Vec<String> = handles
                    .iter()
                    .filter(|(_, join)| !join.is_finished())
                    .map(|(id, _)| id.clone())
                    .collect();
                tracing::warn!(grace_ms = grace.as_millis() as u64, stuck = ?stuck, "shutdown grace exceeded");
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    fn spawn_task(&self, entity: Entity, update: &EntityUpdated) -> Slot {
        let shared = &self.shared;
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = shared.token.child_token();

        let task = ReconcileTask {
            entity,
            target: update.target_version.clone(),
            generation,
            shared: Arc::clone(shared),
        };
        let join = shared.runtime.spawn(task.run(cancel.clone()));

        Slot {
            generation,
            target: update.target_version.clone(),
            asserted_at: update.timestamp,
            cancel,
            join,
        }
    }
}

/// Bus handler feeding `entity-updated` into the reconciler.
///
/// Holds a weak reference so the subscription never keeps the reconciler alive.
struct UpdateListener {
    shared: Weak<Shared>,
}

impl Subscribe for UpdateListener {
    fn on_message(&self, message: &Message) {
        let Message::EntityUpdated(update) = message else {
            return;
        };
        if let Some(shared) = self.shared.upgrade() {
            Reconciler { shared }.notify(update);
        }
    }

    fn name(&self) -> &str {
        "reconciler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::events::{Converged, FleetConverged, ReconcileFailed};
    use std::sync::atomic::AtomicU32;
    use std::sync::OnceLock;
    use crate::policies::BackoffPolicy;
    use crate::reconcile::probe::Observed;
    use async_trait::async_trait;
    use tokio::time::{self, Instant};

    /// Answers each entity from a fixed script; the last step repeats forever.
    #[derive(Default)]
    struct ScriptedProbe {
        scripts: Mutex<HashMap<String, Vec<Result<Observed, ProbeError>>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedProbe {
        fn script(self, id: &str, steps: Vec<Result<Observed, ProbeError>>) -> Self {
            self.scripts.lock().insert(id.to_string(), steps);
            self
        }

        fn calls(&self, id: &str) -> usize {
            self.calls.lock().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl StatusProbe for ScriptedProbe {
        async fn probe(&self, entity: &Entity) -> Result<Observed, ProbeError> {
            let n = {
                let mut calls = self.calls.lock();
                let c = calls.entry(entity.id.clone()).or_default();
                *c += 1;
                *c - 1
            };
            let scripts = self.scripts.lock();
            let steps = &scripts[&entity.id];
            steps[n.min(steps.len() - 1)].clone()
        }
    }

    fn v(version: &str) -> Result<Observed, ProbeError> {
        Ok(Observed::version(version))
    }

    fn config(max_attempts: u32, admission: AdmissionPolicy) -> Config {
        Config {
            max_attempts,
            backoff: BackoffPolicy::fixed(Duration::from_secs(10)),
            admission,
            ..Config::default()
        }
    }

    struct Harness {
        bus: Bus,
        registry: EntityRegistry,
        probe: Arc<ScriptedProbe>,
        reconciler: Reconciler,
        seen: Arc<Mutex<Vec<Message>>>,
    }

    fn harness(probe: ScriptedProbe, cfg: Config) -> Harness {
        let bus = Bus::new();
        let registry = EntityRegistry::from_entities(
            [
                Entity::new("gke", "Kubernetes", "http://gke.local/").with_version("v1"),
                Entity::new("run", "Cloud Run", "http://run.local/").with_version("v1"),
            ],
            5,
        )
        .unwrap();
        let probe = Arc::new(probe);
        let reconciler =
            Reconciler::new(bus.clone(), registry.clone(), probe.clone(), &cfg).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for topic in [
            Topic::Converged,
            Topic::FleetConverged,
            Topic::ReconcileFailed,
            Topic::EntityDegraded,
        ] {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn(topic, move |m| seen.lock().push(m.clone()));
        }

        Harness {
            bus,
            registry,
            probe,
            reconciler,
            seen,
        }
    }

    fn converged(seen: &Mutex<Vec<Message>>) -> Vec<Converged> {
        seen.lock()
            .iter()
            .filter_map(|m| match m {
                Message::Converged(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn fleet_converged(seen: &Mutex<Vec<Message>>) -> Vec<FleetConverged> {
        seen.lock()
            .iter()
            .filter_map(|m| match m {
                Message::FleetConverged(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_third_poll() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1"), v("v1"), v("v2")]),
            config(4, AdmissionPolicy::DropIfRunning),
        );
        let converged_at = Arc::new(Mutex::new(None));
        let converged_at_w = Arc::clone(&converged_at);
        h.bus.subscribe_fn(Topic::Converged, move |_| {
            *converged_at_w.lock() = Some(Instant::now());
        });

        let start = Instant::now();
        h.bus.publish(Message::EntityUpdated(EntityUpdated::new("gke", "v2")));
        assert!(h.reconciler.is_active("gke"));
        assert_eq!(h.registry.get("gke").unwrap().version.as_deref(), Some("v1"));

        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.probe.calls("gke"), 3);
        assert_eq!(h.registry.get("gke").unwrap().version.as_deref(), Some("v2"));
        let events = converged(&h.seen);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, "v2");
        assert_eq!(events[0].duration, 20.0);
        let at = (*converged_at.lock()).expect("converged handler ran");
        let elapsed = at - start;
        assert_eq!(elapsed.as_secs(), 20);
        assert!(!h.reconciler.is_active("gke"));
        assert_eq!(h.reconciler.stats().converged, 1);
        assert_eq!(h.registry.history("gke")[0].version, "v1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_assertions_run_one_sequence() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1")]),
            config(3, AdmissionPolicy::DropIfRunning),
        );

        let update = EntityUpdated::new("gke", "v2");
        assert_eq!(h.reconciler.notify(&update), Admission::Started);
        assert_eq!(
            h.reconciler.notify(&update),
            Admission::Duplicate {
                active_target: "v2".into()
            }
        );
        h.bus.publish(Message::EntityUpdated(update.clone()));

        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.probe.calls("gke"), 3);
        let stats = h.reconciler.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.gave_up, 1);
        assert_eq!(stats.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts_and_keeps_version() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1")]),
            config(4, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("gke", "v9"));
        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.probe.calls("gke"), 4);
        assert_eq!(h.registry.get("gke").unwrap().version.as_deref(), Some("v1"));
        let failed: Vec<Message> = h
            .seen
            .lock()
            .iter()
            .filter(|m| m.topic() == Topic::ReconcileFailed)
            .cloned()
            .collect();
        assert_eq!(
            failed,
            vec![Message::ReconcileFailed(ReconcileFailed {
                entity_id: "gke".into(),
                target_version: "v9".into(),
                attempts: 4,
                last_observed: Some("v1".into()),
            })]
        );
        assert!(converged(&h.seen).is_empty());

        assert_eq!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v9")),
            Admission::Started
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_fault_marks_degraded_until_next_good_poll() {
        let h = harness(
            ScriptedProbe::default().script(
                "run",
                vec![Err(ProbeError::Status { code: 503 }), v("v2")],
            ),
            config(4, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("run", "v2"));
        time::sleep(Duration::from_secs(1)).await;

        let entity = h.registry.get("run").unwrap();
        assert_eq!(entity.degraded.as_deref(), Some("status endpoint returned 503"));
        assert_eq!(entity.version.as_deref(), Some("v1"));

        time::sleep(Duration::from_secs(30)).await;

        let entity = h.registry.get("run").unwrap();
        assert!(!entity.is_degraded());
        assert_eq!(entity.version.as_deref(), Some("v2"));
        assert_eq!(h.probe.calls("run"), 2);

        let degraded: Vec<Message> = h
            .seen
            .lock()
            .iter()
            .filter(|m| m.topic() == Topic::EntityDegraded)
            .cloned()
            .collect();
        assert_eq!(degraded.len(), 1);
        assert_eq!(h.reconciler.stats().faults, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_entity_is_dropped() {
        let h = harness(ScriptedProbe::default(), config(4, AdmissionPolicy::DropIfRunning));

        assert_eq!(
            h.reconciler.notify(&EntityUpdated::new("flex", "v2")),
            Admission::UnknownEntity
        );
        assert!(h.reconciler.active().is_empty());
        assert!(h.registry.get("flex").is_none());
        assert_eq!(h.reconciler.stats().unknown, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_supersedes_only_newer_different_target() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1"), v("v3")]),
            config(4, AdmissionPolicy::Replace),
        );
        let t0: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let t1: DateTime<Utc> = "2024-05-01T10:05:00Z".parse().unwrap();

        assert_eq!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v2").at(t1)),
            Admission::Started
        );
        assert!(matches!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v3").at(t0)),
            Admission::Duplicate { .. }
        ));
        assert!(matches!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v2").at(t1 + chrono::Duration::minutes(1))),
            Admission::Duplicate { .. }
        ));
        assert_eq!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v3").at(t1 + chrono::Duration::minutes(2))),
            Admission::Superseded {
                previous_target: "v2".into()
            }
        );
        assert_eq!(h.reconciler.active_target("gke").as_deref(), Some("v3"));

        time::sleep(Duration::from_secs(60)).await;

        let events = converged(&h.seen);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, "v3");
        assert_eq!(h.registry.get("gke").unwrap().version.as_deref(), Some("v3"));
        let stats = h.reconciler.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.converged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_registry_untouched() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1"), v("v2")]),
            config(4, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("gke", "v2"));
        time::sleep(Duration::from_secs(1)).await;
        assert!(h.reconciler.cancel("gke"));
        assert!(!h.reconciler.cancel("gke"));

        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.probe.calls("gke"), 1);
        assert_eq!(h.registry.get("gke").unwrap().version.as_deref(), Some("v1"));
        assert!(converged(&h.seen).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entities_reconcile_independently() {
        let h = harness(
            ScriptedProbe::default()
                .script("gke", vec![v("v2")])
                .script("run", vec![v("v1"), v("v1"), v("v2")]),
            config(6, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("gke", "v2"));
        h.reconciler.notify(&EntityUpdated::new("run", "v2"));
        assert_eq!(h.reconciler.active(), vec!["gke", "run"]);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.reconciler.active(), vec!["run"]);

        time::sleep(Duration::from_secs(60)).await;
        let ids: Vec<String> = converged(&h.seen).into_iter().map(|c| c.entity_id).collect();
        assert_eq!(ids, vec!["gke", "run"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_converged_once_every_entity_agrees() {
        let h = harness(
            ScriptedProbe::default()
                .script("gke", vec![v("v2")])
                .script("run", vec![v("v1"), v("v2")]),
            config(4, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("gke", "v2"));
        time::sleep(Duration::from_secs(1)).await;
        assert!(fleet_converged(&h.seen).is_empty());

        h.reconciler.notify(&EntityUpdated::new("run", "v2"));
        time::sleep(Duration::from_secs(30)).await;
        let fleet = fleet_converged(&h.seen);
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet[0].version, "v2");
        assert_eq!(h.registry.uniform_version().as_deref(), Some("v2"));

        // Re-confirming a version the entity already had is not a new fleet event.
        h.reconciler.notify(&EntityUpdated::new("gke", "v2"));
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(converged(&h.seen).len(), 3);
        assert_eq!(fleet_converged(&h.seen).len(), 1);
    }

    /// Supersedes its own task from inside the first query, then fails it.
    struct SupersedeDuringQuery {
        reconciler: OnceLock<Reconciler>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StatusProbe for SupersedeDuringQuery {
        async fn probe(&self, _entity: &Entity) -> Result<Observed, ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let reconciler = self.reconciler.get().expect("reconciler installed");
                let newer = EntityUpdated::new("gke", "v3").at(Utc::now() + chrono::Duration::minutes(1));
                assert!(matches!(
                    reconciler.notify(&newer),
                    Admission::Superseded { .. }
                ));
                return Err(ProbeError::Status { code: 503 });
            }
            Ok(Observed::version("v3"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_task_fault_does_not_degrade() {
        let bus = Bus::new();
        let registry = EntityRegistry::from_entities(
            [Entity::new("gke", "Kubernetes", "http://gke.local/").with_version("v1")],
            5,
        )
        .unwrap();
        let probe = Arc::new(SupersedeDuringQuery {
            reconciler: OnceLock::new(),
            calls: AtomicU32::new(0),
        });
        let reconciler = Reconciler::new(
            bus.clone(),
            registry.clone(),
            probe.clone(),
            &config(4, AdmissionPolicy::Replace),
        )
        .unwrap();
        assert!(probe.reconciler.set(reconciler.clone()).is_ok());

        let degraded = Arc::new(Mutex::new(Vec::new()));
        let degraded_w = Arc::clone(&degraded);
        bus.subscribe_fn(Topic::EntityDegraded, move |m| degraded_w.lock().push(m.clone()));

        reconciler.notify(&EntityUpdated::new("gke", "v2").at(Utc::now()));
        time::sleep(Duration::from_secs(30)).await;

        assert!(degraded.lock().is_empty());
        let entity = registry.get("gke").unwrap();
        assert!(!entity.is_degraded());
        assert_eq!(entity.version.as_deref(), Some("v3"));
        let stats = reconciler.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.faults, 0);
        assert_eq!(stats.converged, 1);
        reconciler.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_and_stops_admission() {
        let h = harness(
            ScriptedProbe::default().script("gke", vec![v("v1")]),
            config(6, AdmissionPolicy::DropIfRunning),
        );

        h.reconciler.notify(&EntityUpdated::new("gke", "v2"));
        time::sleep(Duration::from_secs(1)).await;

        h.reconciler.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(h.reconciler.active().is_empty());
        assert_eq!(h.reconciler.stats().cancelled, 1);
        assert_eq!(
            h.reconciler.notify(&EntityUpdated::new("gke", "v2")),
            Admission::ShuttingDown
        );
        assert_eq!(h.bus.subscriber_count(&Topic::EntityUpdated), 0);
    }

    #[test]
    fn test_new_requires_runtime() {
        let res = Reconciler::new(
            Bus::new(),
            EntityRegistry::default(),
            Arc::new(ScriptedProbe::default()),
            &Config::default(),
        );
        assert!(matches!(res, Err(RuntimeError::NoRuntime)));
    }
}
