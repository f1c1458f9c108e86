//! # Topic names.
//!
//! A [`Topic`] identifies a category of message on the bus. Topics the core
//! understands get their own variant (and a typed body, see
//! [`Message`](crate::Message)); every other name is carried transparently in
//! [`Topic::Other`].
//!
//! ```rust
//! use fleetwatch::Topic;
//!
//! assert_eq!(Topic::from("entity-updated"), Topic::EntityUpdated);
//! assert_eq!(Topic::Converged.as_str(), "converged");
//! assert_eq!(Topic::from("chat").as_str(), "chat");
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Named channel of the bus.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// "Entity X should now be at version V" (inbound).
    EntityUpdated,
    /// Entity verified at its target version (outbound).
    Converged,
    /// Every tracked entity confirmed at one version (outbound).
    FleetConverged,
    /// Status query for an entity failed (outbound).
    EntityDegraded,
    /// Reconciliation gave up after its attempt budget (outbound).
    ReconcileFailed,
    /// Deployment pipeline progress; carried for external consumers.
    Build,
    /// Deployment pipeline log lines; carried for external consumers.
    Log,
    /// Free-form echo/chat messages; carried for external consumers.
    Echo,
    /// Any topic the core does not interpret.
    Other(Arc<str>),
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &str {
        match self {
            Topic::EntityUpdated => "entity-updated",
            Topic::Converged => "converged",
            Topic::FleetConverged => "fleet-converged",
            Topic::EntityDegraded => "entity-degraded",
            Topic::ReconcileFailed => "reconcile-failed",
            Topic::Build => "build",
            Topic::Log => "log",
            Topic::Echo => "echo",
            Topic::Other(name) => name,
        }
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        match name {
            "entity-updated" => Topic::EntityUpdated,
            "converged" => Topic::Converged,
            "fleet-converged" => Topic::FleetConverged,
            "entity-degraded" => Topic::EntityDegraded,
            "reconcile-failed" => Topic::ReconcileFailed,
            "build" => Topic::Build,
            "log" => Topic::Log,
            "echo" => Topic::Echo,
            other => Topic::Other(Arc::from(other)),
        }
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::from(name.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Topic::from(name))
    }
}
