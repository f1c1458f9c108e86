//! Bus messages: topics, typed payloads and the topic-based dispatcher.
//!
//! This module groups the **message model** carried by the real-time channel
//! and the **bus** that routes messages to interested handlers.
//!
//! ## Contents
//! - [`Topic`] named channel a message belongs to
//! - [`Message`] tagged union over topics, plus the wire [`Envelope`]
//! - [`Bus`] synchronous publish/subscribe dispatcher
//! - [`Subscribe`], [`HandlerFn`] the handler abstraction
//! - [`TraceWriter`] a handler mirroring bus traffic into `tracing`
//!
//! ## Quick reference
//! - **Publishers**: the transport connection loop (decoded frames), the
//!   reconciliation tasks (`converged`, `fleet-converged`, `entity-degraded`,
//!   `reconcile-failed`),
//!   and any local caller of [`Bus::publish`].
//! - **Consumers**: the reconciler (`entity-updated`) and external consumers
//!   such as timeline, log view or notification widgets.

mod bus;
mod message;
mod subscribe;
mod topic;
mod trace;

pub use bus::{Bus, SubscriptionId};
pub use message::{
    BuildStatus, Converged, EntityDegraded, EntityUpdated, Envelope, FleetConverged, Message,
    ReconcileFailed,
};
pub use subscribe::{HandlerFn, Subscribe};
pub use topic::Topic;
pub use trace::TraceWriter;
