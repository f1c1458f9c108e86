//! # TraceWriter: bus traffic mirrored into `tracing`
//!
//! Subscribe it with [`Bus::subscribe_all`](crate::Bus::subscribe_all) to get one
//! structured log record per message.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO  entity-updated entity="gke" target="v2"
//! INFO  converged entity="gke" version="v2"
//! WARN  entity-degraded entity="run" attempt=2 reason="status endpoint returned 503"
//! WARN  reconcile-failed entity="flex" target="v2" attempts=6 last_observed=Some("v1")
//! INFO  build id=Some("b-1") status="finished"
//! DEBUG message topic="log"
//! ```

use super::message::Message;
use super::subscribe::Subscribe;

/// Bus handler that logs every message it receives.
#[derive(Default)]
pub struct TraceWriter;

impl TraceWriter {
    /// Construct a new [`TraceWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Subscribe for TraceWriter {
    fn on_message(&self, message: &Message) {
        match message {
            Message::EntityUpdated(m) => {
                tracing::info!(entity = %m.entity_id, target = %m.target_version, "entity-updated");
            }
            Message::Converged(m) => {
                tracing::info!(
                    entity = %m.entity_id,
                    version = %m.version,
                    duration_secs = m.duration,
                    "converged"
                );
            }
            Message::FleetConverged(m) => {
                tracing::info!(version = %m.version, "fleet-converged");
            }
            Message::EntityDegraded(m) => {
                tracing::warn!(
                    entity = %m.entity_id,
                    attempt = m.attempt,
                    reason = %m.reason,
                    "entity-degraded"
                );
            }
            Message::ReconcileFailed(m) => {
                tracing::warn!(
                    entity = %m.entity_id,
                    target = %m.target_version,
                    attempts = m.attempts,
                    last_observed = ?m.last_observed,
                    "reconcile-failed"
                );
            }
            Message::Build(m) => {
                tracing::info!(id = ?m.id, status = %m.status, "build");
            }
            Message::Other { topic, .. } => {
                tracing::debug!(topic = %topic, "message");
            }
        }
    }

    fn name(&self) -> &str {
        "trace-writer"
    }
}
