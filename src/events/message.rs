//! # Messages carried by the bus and the real-time channel.
//!
//! On the wire every message is an [`Envelope`]: a JSON object with a topic name
//! and a body. Older deployments use `type` instead of `topic` and `data`
//! instead of `body`; both spellings are accepted on input, the canonical one
//! is written on output.
//!
//! ```text
//! {"topic": "entity-updated", "body": {"entityId": "gke", "targetVersion": "v2"}}
//! {"type":  "entity-updated", "data": {"entityId": "gke", "targetVersion": "v2"}}
//! ```
//!
//! `entity-updated` bodies are `{entityId, targetVersion, timestamp?, ...}`;
//! every other key is kept in `meta`, including `id` or `version` keys a
//! producer attaches. Only a body with no `entityId` at all is read in the
//! legacy `{id, version, updated?}` spelling.
//!
//! Inside the process a frame becomes a [`Message`], a tagged union with one
//! typed variant per topic the core interprets. Unknown topics (and topics such
//! as `log` or `echo` that are only relayed) keep their raw JSON body.
//!
//! ## Example
//! ```rust
//! use fleetwatch::{Message, Topic};
//!
//! let msg = Message::decode(r#"{"topic":"entity-updated","body":{"entityId":"gke","targetVersion":"v2"}}"#).unwrap();
//! assert_eq!(msg.topic(), Topic::EntityUpdated);
//! match msg {
//!     Message::EntityUpdated(update) => assert_eq!(update.target_version, "v2"),
//!     _ => unreachable!(),
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::topic::Topic;
use crate::error::DecodeError;

/// Wire form of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic name (`type` accepted as an alias).
    #[serde(alias = "type")]
    pub topic: Topic,
    /// Message body (`data` accepted as an alias); `null` when absent.
    #[serde(default, alias = "data")]
    pub body: Value,
}

/// Assertion that an entity should now run `target_version`.
///
/// This is never trusted as the entity's state: it only starts a reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct EntityUpdated {
    /// Entity the assertion is about.
    pub entity_id: String,
    /// Version the entity should converge to.
    pub target_version: String,
    /// When the assertion was made; used to order competing assertions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Anything else the producer attached (build id, duration, ...).
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl EntityUpdated {
    /// Assertion without timestamp or metadata.
    pub fn new(entity_id: impl Into<String>, target_version: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            target_version: target_version.into(),
            timestamp: None,
            meta: Map::new(),
        }
    }

    /// Attaches an assertion timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Key spellings of one `entity-updated` body shape.
struct Keys {
    entity: &'static [&'static str],
    target: &'static [&'static str],
    timestamp: &'static [&'static str],
}

const CANONICAL: Keys = Keys {
    entity: &["entityId", "entity_id"],
    target: &["targetVersion", "target_version"],
    timestamp: &["timestamp"],
};

const LEGACY: Keys = Keys {
    entity: &["id"],
    target: &["version"],
    timestamp: &["updated"],
};

impl TryFrom<Map<String, Value>> for EntityUpdated {
    type Error = String;

    fn try_from(mut body: Map<String, Value>) -> Result<Self, Self::Error> {
        let keys = if CANONICAL.entity.iter().any(|k| body.contains_key(*k)) {
            &CANONICAL
        } else {
            &LEGACY
        };

        let entity_id = take_string(&mut body, keys.entity)?;
        let target_version = take_string(&mut body, keys.target)?;
        let timestamp = match take_first(&mut body, keys.timestamp) {
            None | Some((_, Value::Null)) => None,
            Some((key, raw)) => Some(
                serde_json::from_value(raw).map_err(|e| format!("invalid `{key}`: {e}"))?,
            ),
        };

        Ok(Self {
            entity_id,
            target_version,
            timestamp,
            meta: body,
        })
    }
}

/// Removes the first key of `keys` present in `body`.
fn take_first(
    body: &mut Map<String, Value>,
    keys: &[&'static str],
) -> Option<(&'static str, Value)> {
    keys.iter().find_map(|k| body.remove(*k).map(|v| (*k, v)))
}

fn take_string(body: &mut Map<String, Value>, keys: &[&'static str]) -> Result<String, String> {
    match take_first(body, keys) {
        Some((_, Value::String(s))) => Ok(s),
        Some((key, other)) => Err(format!("`{key}` must be a string, got {other}")),
        None => Err(format!("missing field `{}`", keys[0])),
    }
}

/// An entity was observed at its target version and the registry was updated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Converged {
    /// Converged entity.
    pub entity_id: String,
    /// Version now confirmed.
    pub version: String,
    /// When convergence was observed.
    pub timestamp: DateTime<Utc>,
    /// Seconds from the admitted assertion to the matching poll.
    #[serde(default)]
    pub duration: f64,
}

/// Every tracked entity now reports the same confirmed version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConverged {
    /// Version shared by the whole fleet.
    pub version: String,
    /// When the last entity converged.
    pub timestamp: DateTime<Utc>,
}

/// A status query failed; the entity is shown as degraded until the next good poll.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDegraded {
    /// Affected entity.
    pub entity_id: String,
    /// Attempt number of the failed poll (1-based).
    pub attempt: u32,
    /// Human-readable fault.
    pub reason: String,
}

/// A reconciliation exhausted its attempt budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailed {
    /// Entity that did not converge.
    pub entity_id: String,
    /// Version it was expected to reach.
    pub target_version: String,
    /// Polls made before giving up.
    pub attempts: u32,
    /// Last version the entity reported, if any poll succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<String>,
}

/// Deployment pipeline progress (`started`, `finished`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    /// Build identifier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Pipeline status string.
    pub status: String,
    /// Extra producer fields.
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl BuildStatus {
    /// True once the pipeline reports it is done.
    pub fn is_finished(&self) -> bool {
        self.status.eq_ignore_ascii_case("finished")
    }
}

/// A decoded bus message: one variant per interpreted topic.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// `entity-updated`
    EntityUpdated(EntityUpdated),
    /// `converged`
    Converged(Converged),
    /// `fleet-converged`
    FleetConverged(FleetConverged),
    /// `entity-degraded`
    EntityDegraded(EntityDegraded),
    /// `reconcile-failed`
    ReconcileFailed(ReconcileFailed),
    /// `build`
    Build(BuildStatus),
    /// Any other topic, body kept as JSON.
    Other {
        /// Topic name.
        topic: Topic,
        /// Raw body.
        body: Value,
    },
}

impl Message {
    /// Topic this message is routed on.
    pub fn topic(&self) -> Topic {
        match self {
            Message::EntityUpdated(_) => Topic::EntityUpdated,
            Message::Converged(_) => Topic::Converged,
            Message::FleetConverged(_) => Topic::FleetConverged,
            Message::EntityDegraded(_) => Topic::EntityDegraded,
            Message::ReconcileFailed(_) => Topic::ReconcileFailed,
            Message::Build(_) => Topic::Build,
            Message::Other { topic, .. } => topic.clone(),
        }
    }

    /// Builds a message from a topic and a JSON body.
    ///
    /// Interpreted topics must carry a body of the right shape; other topics
    /// accept anything.
    pub fn from_parts(topic: impl Into<Topic>, body: Value) -> Result<Self, DecodeError> {
        let topic = topic.into();
        let msg = match &topic {
            Topic::EntityUpdated => Message::EntityUpdated(typed_body(&topic, body)?),
            Topic::Converged => Message::Converged(typed_body(&topic, body)?),
            Topic::FleetConverged => Message::FleetConverged(typed_body(&topic, body)?),
            Topic::EntityDegraded => Message::EntityDegraded(typed_body(&topic, body)?),
            Topic::ReconcileFailed => Message::ReconcileFailed(typed_body(&topic, body)?),
            Topic::Build => Message::Build(typed_body(&topic, body)?),
            Topic::Log | Topic::Echo | Topic::Other(_) => Message::Other { topic, body },
        };
        Ok(msg)
    }

    /// Decodes a text frame.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        Self::from_envelope(envelope)
    }

    /// Decodes a binary frame holding UTF-8 JSON.
    pub fn decode_slice(frame: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(frame)?;
        Self::from_envelope(envelope)
    }

    /// Converts a wire envelope.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, DecodeError> {
        Self::from_parts(envelope.topic, envelope.body)
    }

    /// Converts into the wire envelope.
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let body = match self {
            Message::EntityUpdated(b) => serde_json::to_value(b)?,
            Message::Converged(b) => serde_json::to_value(b)?,
            Message::FleetConverged(b) => serde_json::to_value(b)?,
            Message::EntityDegraded(b) => serde_json::to_value(b)?,
            Message::ReconcileFailed(b) => serde_json::to_value(b)?,
            Message::Build(b) => serde_json::to_value(b)?,
            Message::Other { body, .. } => body.clone(),
        };
        Ok(Envelope {
            topic: self.topic(),
            body,
        })
    }

    /// Encodes as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope()?)
    }
}

fn typed_body<T: DeserializeOwned>(topic: &Topic, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|e| DecodeError::Body {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}
