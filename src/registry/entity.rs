//! # Tracked entities.
//!
//! An [`Entity`] is one deployable service instance of the fleet: where to ask
//! for its live version, and the last version that was actually confirmed.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last-confirmed state of one tracked service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable unique key.
    pub id: String,
    /// Display name.
    pub title: String,
    /// Endpoint returning the live version as JSON (`{"version": "..."}`).
    pub status_url: String,
    /// Last confirmed version; `None` until the first confirmation if not configured.
    pub version: Option<String>,
    /// When `version` was last confirmed (or the entity was registered).
    pub last_updated: DateTime<Utc>,
    /// Reason of the last failed status query, cleared by the next good one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl Entity {
    /// New entity with unknown version.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        status_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status_url: status_url.into(),
            version: None,
            last_updated: Utc::now(),
            degraded: None,
        }
    }

    /// Sets the initially known version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// True when the last status query failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// A previously confirmed version, kept in the registry history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    /// Version that was confirmed.
    pub version: String,
    /// When it was confirmed.
    pub confirmed_at: DateTime<Utc>,
}
