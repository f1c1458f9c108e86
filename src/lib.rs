//! # fleetwatch
//!
//! **fleetwatch** tracks fleet-wide deployments in real time.
//!
//! A deployment pipeline announces on a websocket that an entity *should* now
//! run a given version. fleetwatch does not take that at face value: it polls
//! the entity's own status endpoint until the reported version matches the
//! target, or gives up after a bounded number of attempts. Only a confirmed
//! match updates the [`EntityRegistry`].
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                       websocket server
//!                              │ frames {"topic": .., "body": ..}
//!                              ▼
//!                 ┌────────────────────────────┐
//!                 │ Connection (one live link, │
//!                 │ fixed-delay reconnect)     │
//!                 └─────────────┬──────────────┘
//!                               │ Message::decode
//!                               ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Bus (topic → handlers)                       │
//! └──────┬───────────────────────┬─────────────────────────────┬──────┘
//!        │ "entity-updated"      │ every topic                 ▲
//!        ▼                       ▼                             │ converged, fleet-converged
//! ┌──────────────┐       user subscribers                      │ entity-degraded
//! │  Reconciler  │       (timeline, logs, TraceWriter)         │ reconcile-failed
//! │ one slot per │                                             │
//! │    entity    │──spawn──► ReconcileTask ──poll_until──► StatusProbe
//! └──────────────┘                 │
//!                                  ▼ version == target
//!                           EntityRegistry (version, history, degraded)
//! ```
//!
//! ### Reconciliation lifecycle
//! ```text
//! EntityUpdated{entity, target} ──► Reconciler::notify
//!   ├─ unknown entity         ─► dropped (warn)
//!   ├─ task already active    ─► Duplicate  (or Superseded under Replace)
//!   └─ slot free              ─► ReconcileTask::run()
//!
//! attempt in 1..=max_attempts {
//!   ├─► probe(entity) with per-poll timeout
//!   │      ├─ fault     ─► mark degraded, publish EntityDegraded
//!   │      ├─ matched   ─► record convergence, publish Converged{duration}
//!   │      │               (+ FleetConverged once every entity shares it), exit
//!   │      └─ mismatch  ─► clear degraded
//!   └─► sleep(backoff) unless last attempt (cancellable)
//! }
//! exhausted ─► publish ReconcileFailed, registry untouched
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                          |
//! |-------------------|----------------------------------------------------------|---------------------------------------------|
//! | **Context**       | Wires every component; connect, shutdown, signals.       | [`FleetWatch`], [`FleetWatchBuilder`]       |
//! | **Bus**           | Topic publish/subscribe, typed messages.                 | [`Bus`], [`Message`], [`Topic`], [`Subscribe`] |
//! | **Transport**     | Reconnecting websocket feeding the bus.                  | [`Connection`], [`TransportHandle`]         |
//! | **Registry**      | Last confirmed version of every entity.                  | [`EntityRegistry`], [`Entity`]              |
//! | **Reconciliation**| Bounded, deduplicated polling per entity.                | [`Reconciler`], [`StatusProbe`], [`poll_until`] |
//! | **Policies**      | Backoff, jitter, retry limits, admission.                | [`RetryPolicy`], [`BackoffPolicy`], [`AdmissionPolicy`] |
//! | **Configuration** | Defaults plus YAML fleet files.                          | [`Config`], [`FleetFile`]                   |
//! | **Deploy**        | Client for the deployment trigger endpoint.              | [`DeployTrigger`], [`HttpDeployTrigger`]    |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetwatch::{FleetFile, FleetWatchBuilder, Subscribe, TraceWriter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = FleetFile::load("fleet.yaml")?;
//!     let trace: Arc<dyn Subscribe> = Arc::new(TraceWriter::new());
//!
//!     let fw = FleetWatchBuilder::from_fleet_file(&file)?
//!         .with_subscribers(vec![trace])
//!         .build()?;
//!     fw.connect("ws://localhost:8000/ws")?;
//!
//!     fw.run_until_signal().await?;
//!     for entity in fw.registry().list() {
//!         println!("{} {:?}", entity.id, entity.version);
//!     }
//!     Ok(())
//! }
//! ```
mod config;
mod context;
mod deploy;
mod error;
mod events;
mod policies;
mod reconcile;
mod registry;
mod transport;

// ---- Public re-exports ----

pub use config::{BackoffSettings, Config, EntitySpec, FleetFile, Settings};
pub use context::{FleetWatch, FleetWatchBuilder};
pub use deploy::{DeployOutcome, DeployRequest, DeployTrigger, DeploymentJob, HttpDeployTrigger};
pub use error::{
    ConfigError, DecodeError, DeployError, ProbeError, RuntimeError, TransportError,
};
pub use events::{
    BuildStatus, Bus, Converged, EntityDegraded, EntityUpdated, Envelope, FleetConverged,
    HandlerFn, Message, ReconcileFailed, Subscribe, SubscriptionId, Topic, TraceWriter,
};
pub use policies::{AdmissionPolicy, BackoffPolicy, JitterPolicy, RetryPolicy};
pub use reconcile::{
    poll_until, Admission, Fault, HttpProbe, Observed, PollOutcome, PollStep, ReconcileStats,
    Reconciler, StatusProbe, TaskOutcome,
};
pub use registry::{Entity, EntityRegistry, VersionRecord};
pub use transport::{Connection, ConnectionState, TransportHandle};
