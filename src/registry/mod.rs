//! # Entity registry - last confirmed state of the fleet.
//!
//! The registry is the single source of truth read by external consumers
//! (timeline, status badges). It is populated once from configuration and then
//! written only by the reconciler.
//!
//! ## Architecture
//! ```text
//! FleetFile ──► EntityRegistry::from_entities()        (initialization)
//!
//! ReconcileTask ── poll ok, version == target ──► record_convergence()
//!               ── poll failed               ──► mark_degraded()
//!               ── poll ok                    ──► clear_degraded()
//!
//! external readers ──► get() / list() / history()     (any cadence)
//! ```
//!
//! ## Rules
//! - `version` changes only through `record_convergence` / `upsert`, both
//!   crate-internal; notification payloads never reach the registry.
//! - Entries are never removed during a session.
//! - Every previously confirmed version is pushed to a bounded history.

mod entity;

pub use entity::{Entity, VersionRecord};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::ConfigError;

/// Entity plus its version history.
struct Record {
    entity: Entity,
    /// Newest first.
    history: VecDeque<VersionRecord>,
}

impl Record {
    fn new(entity: Entity) -> Self {
        Self {
            entity,
            history: VecDeque::new(),
        }
    }

    /// Replaces the entity, archiving the previous version if it changed.
    fn replace(&mut self, next: Entity, history_len: usize) {
        if let Some(prev) = self.entity.version.take() {
            if next.version.as_deref() != Some(prev.as_str()) && history_len > 0 {
                self.history.push_front(VersionRecord {
                    version: prev,
                    confirmed_at: self.entity.last_updated,
                });
                self.history.truncate(history_len);
            }
        }
        self.entity = next;
    }
}

struct Inner {
    entries: RwLock<HashMap<String, Record>>,
    history_len: usize,
}

/// Shared, cheaply cloneable registry of tracked entities.
#[derive(Clone)]
pub struct EntityRegistry {
    inner: Arc<Inner>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new(5)
    }
}

impl EntityRegistry {
    /// Empty registry keeping `history_len` past versions per entity.
    pub fn new(history_len: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                history_len,
            }),
        }
    }

    /// Registry initialized from static configuration.
    ///
    /// Fails on duplicate ids.
    pub fn from_entities(
        entities: impl IntoIterator<Item = Entity>,
        history_len: usize,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new(history_len);
        for entity in entities {
            if registry.contains(&entity.id) {
                return Err(ConfigError::DuplicateEntity(entity.id));
            }
            registry.upsert(entity);
        }
        Ok(registry)
    }

    /// Returns a copy of the entity, if tracked.
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.inner.entries.read().get(id).map(|r| r.entity.clone())
    }

    /// True if the entity is tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries.read().contains_key(id)
    }

    /// All entities, sorted by id.
    pub fn list(&self) -> Vec<Entity> {
        let entries = self.inner.entries.read();
        let mut all: Vec<Entity> = entries.values().map(|r| r.entity.clone()).collect();
        all.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Previously confirmed versions of an entity, newest first.
    pub fn history(&self, id: &str) -> Vec<VersionRecord> {
        self.inner
            .entries
            .read()
            .get(id)
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The version every tracked entity reports, if they all agree.
    ///
    /// `None` for an empty registry or while any entity has no known version.
    pub fn uniform_version(&self) -> Option<String> {
        let entries = self.inner.entries.read();
        let mut versions = entries.values().map(|r| r.entity.version.as_deref());
        let first = versions.next()??;
        versions
            .all(|v| v == Some(first))
            .then(|| first.to_string())
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// True if no entity is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Replaces (or inserts) an entity as a whole.
    pub(crate) fn upsert(&self, entity: Entity) {
        let mut entries = self.inner.entries.write();
        match entries.get_mut(&entity.id) {
            Some(record) => record.replace(entity, self.inner.history_len),
            None => {
                entries.insert(entity.id.clone(), Record::new(entity));
            }
        }
    }

    /// Stores a verified version; merges the reported title and clears degradation.
    ///
    /// Returns the updated entity, or `None` if the id is not tracked.
    pub(crate) fn record_convergence(
        &self,
        id: &str,
        version: &str,
        title: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<Entity> {
        let mut entries = self.inner.entries.write();
        let record = entries.get_mut(id)?;

        let mut next = record.entity.clone();
        next.version = Some(version.to_string());
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            next.title = title.to_string();
        }
        next.last_updated = at;
        next.degraded = None;

        record.replace(next.clone(), self.inner.history_len);
        Some(next)
    }

    /// Sets the degraded marker. Returns `true` if the entity was healthy before.
    pub(crate) fn mark_degraded(&self, id: &str, reason: &str) -> bool {
        let mut entries = self.inner.entries.write();
        match entries.get_mut(id) {
            Some(record) => record.entity.degraded.replace(reason.to_string()).is_none(),
            None => false,
        }
    }

    /// Clears the degraded marker. Returns `true` if it was set.
    pub(crate) fn clear_degraded(&self, id: &str) -> bool {
        let mut entries = self.inner.entries.write();
        entries
            .get_mut(id)
            .and_then(|record| record.entity.degraded.take())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> EntityRegistry {
        EntityRegistry::from_entities(
            [
                Entity::new("gke", "Kubernetes", "http://gke.local/").with_version("v1"),
                Entity::new("run", "Cloud Run", "http://run.local/"),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let res = EntityRegistry::from_entities(
            [
                Entity::new("gke", "a", "http://a/"),
                Entity::new("gke", "b", "http://b/"),
            ],
            5,
        );
        assert!(matches!(res, Err(ConfigError::DuplicateEntity(id)) if id == "gke"));
    }

    #[test]
    fn test_list_is_sorted_and_get_misses_unknown() {
        let reg = fleet();
        let ids: Vec<String> = reg.list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["gke", "run"]);
        assert!(reg.get("flex").is_none());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_record_convergence_updates_and_archives() {
        let reg = fleet();
        let at = Utc::now();
        reg.mark_degraded("gke", "boom");

        let updated = reg.record_convergence("gke", "v2", Some("GKE"), at).unwrap();
        assert_eq!(updated.version.as_deref(), Some("v2"));
        assert_eq!(updated.title, "GKE");
        assert_eq!(updated.last_updated, at);
        assert!(!updated.is_degraded());

        let history = reg.history("gke");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, "v1");
    }

    #[test]
    fn test_history_is_bounded_and_skips_same_version() {
        let reg = fleet();
        for v in ["v2", "v3", "v3", "v4"] {
            reg.record_convergence("gke", v, None, Utc::now());
        }
        let versions: Vec<String> = reg.history("gke").into_iter().map(|r| r.version).collect();
        assert_eq!(versions, vec!["v3", "v2"]);
        assert_eq!(reg.get("gke").unwrap().version.as_deref(), Some("v4"));
    }

    #[test]
    fn test_unknown_entity_is_never_created() {
        let reg = fleet();
        assert!(reg.record_convergence("flex", "v2", None, Utc::now()).is_none());
        assert!(!reg.mark_degraded("flex", "boom"));
        assert!(!reg.contains("flex"));
    }

    #[test]
    fn test_degraded_marker_transitions() {
        let reg = fleet();
        assert!(reg.mark_degraded("run", "timeout"));
        assert!(!reg.mark_degraded("run", "timeout again"));
        assert_eq!(reg.get("run").unwrap().degraded.as_deref(), Some("timeout again"));
        assert!(reg.clear_degraded("run"));
        assert!(!reg.clear_degraded("run"));
    }

    #[test]
    fn test_uniform_version() {
        let reg = fleet();
        assert_eq!(EntityRegistry::default().uniform_version(), None);
        for id in reg.list().into_iter().map(|e| e.id) {
            assert_eq!(reg.uniform_version(), None);
            reg.record_convergence(&id, "v9", None, Utc::now());
        }
        assert_eq!(reg.uniform_version().as_deref(), Some("v9"));

        reg.upsert(Entity::new("new", "New", "http://new/"));
        assert_eq!(reg.uniform_version(), None);
    }

    #[test]
    fn test_upsert_replaces_whole_entity() {
        let reg = fleet();
        let mut e = reg.get("run").unwrap();
        e.title = "Run".into();
        e.version = Some("v9".into());
        reg.upsert(e);
        assert_eq!(reg.get("run").unwrap().title, "Run");
        assert!(reg.history("run").is_empty());

        reg.upsert(Entity::new("flex", "Flex", "http://flex/"));
        assert!(reg.contains("flex"));
    }
}
