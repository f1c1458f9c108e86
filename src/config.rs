//! # Runtime configuration and the fleet file.
//!
//! [`Config`] holds the runtime knobs (transport reconnect, retry budget,
//! admission, shutdown grace). [`FleetFile`] is the YAML document an operator
//! writes: optional setting overrides plus the list of tracked entities.
//!
//! ## Sentinel values
//! - `connect_timeout = 0s` → no timeout on the websocket handshake
//! - `poll_timeout = 0s` → no per-poll timeout
//! - `history_len = 0` → previous versions are not kept
//!
//! ## Fleet file
//! ```yaml
//! settings:             # every key optional, durations in seconds
//!   reconnect_delay: 10
//!   max_attempts: 6
//!   backoff: { first: 10, factor: 1.0, max: 10, jitter: none }
//!   poll_timeout: 5
//!   admission: drop-if-running   # or: replace
//! entities:
//!   - id: gke
//!     title: Kubernetes Engine
//!     status_url: https://gke.example.com/api/status
//!     version: v1                # optional, last known version
//! ```
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use fleetwatch::{AdmissionPolicy, Config};
//!
//! let mut cfg = Config::default();
//! cfg.max_attempts = 4;
//! cfg.admission = AdmissionPolicy::Replace;
//! cfg.poll_timeout = Duration::ZERO;
//!
//! assert_eq!(cfg.retry_policy().attempts(), 4);
//! assert_eq!(cfg.poll_timeout(), None);
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::policies::{AdmissionPolicy, BackoffPolicy, JitterPolicy, RetryPolicy};
use crate::registry::Entity;

/// Runtime configuration.
///
/// ## Notes
/// All fields are public. Prefer the helper accessors over sprinkling sentinel
/// checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Pause between a transport close and the next connection attempt.
    pub reconnect_delay: Duration,

    /// Upper bound for the websocket handshake (`0s` = unbounded).
    pub connect_timeout: Duration,

    /// Status queries a reconciliation task may make before giving up.
    pub max_attempts: u32,

    /// Delay schedule between status queries.
    pub backoff: BackoffPolicy,

    /// Upper bound for a single status query (`0s` = unbounded).
    ///
    /// Applied both as the HTTP client timeout and around the whole query.
    pub poll_timeout: Duration,

    /// What to do with an assertion for an entity that is already reconciling.
    pub admission: AdmissionPolicy,

    /// Maximum wait for reconciliation tasks to stop on shutdown.
    pub grace: Duration,

    /// Outbound transport queue size (min 1).
    pub outbound_capacity: usize,

    /// Previously confirmed versions kept per entity.
    pub history_len: usize,
}

impl Config {
    /// Returns the retry policy handed to every reconciliation task.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            attempt_timeout: self.poll_timeout(),
        }
    }

    /// Returns the per-poll timeout as an `Option`.
    #[inline]
    pub fn poll_timeout(&self) -> Option<Duration> {
        if self.poll_timeout == Duration::ZERO {
            None
        } else {
            Some(self.poll_timeout)
        }
    }

    /// Returns the handshake timeout as an `Option`.
    #[inline]
    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout == Duration::ZERO {
            None
        } else {
            Some(self.connect_timeout)
        }
    }

    /// Returns the outbound queue size clamped to a minimum of 1.
    #[inline]
    pub fn outbound_capacity_clamped(&self) -> usize {
        self.outbound_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `reconnect_delay = 10s`, `connect_timeout = 10s`
    /// - `max_attempts = 6`, `backoff = fixed 10s`, `poll_timeout = 5s`
    /// - `admission = DropIfRunning`
    /// - `grace = 30s`
    /// - `outbound_capacity = 64`, `history_len = 5`
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 6,
            backoff: BackoffPolicy::default(),
            poll_timeout: Duration::from_secs(5),
            admission: AdmissionPolicy::default(),
            grace: Duration::from_secs(30),
            outbound_capacity: 64,
            history_len: 5,
        }
    }
}

/// Backoff section of the fleet file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
    /// First delay, seconds.
    pub first: f64,
    /// Growth factor (`1.0` = fixed).
    #[serde(default = "one")]
    pub factor: f64,
    /// Cap, seconds (defaults to `first`).
    #[serde(default)]
    pub max: Option<f64>,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterPolicy,
}

fn one() -> f64 {
    1.0
}

/// Optional overrides of [`Config`] defaults. Durations are in seconds.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Overrides [`Config::reconnect_delay`].
    pub reconnect_delay: Option<f64>,
    /// Overrides [`Config::connect_timeout`]; `0` = unbounded.
    pub connect_timeout: Option<f64>,
    /// Overrides [`Config::max_attempts`]; must be at least 1.
    pub max_attempts: Option<u32>,
    /// Replaces the fixed [`Config::backoff`] schedule.
    pub backoff: Option<BackoffSettings>,
    /// Overrides [`Config::poll_timeout`]; `0` = unbounded.
    pub poll_timeout: Option<f64>,
    /// Overrides [`Config::admission`] (`drop-if-running` or `replace`).
    pub admission: Option<AdmissionPolicy>,
    /// Overrides [`Config::grace`].
    pub grace: Option<f64>,
    /// Overrides [`Config::outbound_capacity`].
    pub outbound_capacity: Option<usize>,
    /// Overrides [`Config::history_len`].
    pub history_len: Option<usize>,
}

/// One tracked entity as written in the fleet file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySpec {
    /// Unique, non-empty identifier; `entity-updated` messages refer to it.
    pub id: String,
    /// Defaults to the id.
    #[serde(default)]
    pub title: Option<String>,
    /// `http` or `https` endpoint answering `{"version": ..}`.
    pub status_url: String,
    /// Version assumed running at startup; unknown when omitted.
    #[serde(default)]
    pub version: Option<String>,
}

impl EntitySpec {
    fn to_entity(&self) -> Entity {
        let title = self.title.clone().unwrap_or_else(|| self.id.clone());
        let entity = Entity::new(self.id.clone(), title, self.status_url.clone());
        match &self.version {
            Some(v) => entity.with_version(v.clone()),
            None => entity,
        }
    }
}

/// Parsed and validated fleet definition.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetFile {
    #[serde(default)]
    pub settings: Settings,
    pub entities: Vec<EntitySpec>,
}

impl FleetFile {
    /// Reads and validates a fleet file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a fleet file from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: FleetFile = serde_yaml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    /// Default [`Config`] with this file's overrides applied.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let s = &self.settings;
        let mut cfg = Config::default();

        if let Some(v) = s.reconnect_delay {
            cfg.reconnect_delay = secs("reconnect_delay", v)?;
        }
        if let Some(v) = s.connect_timeout {
            cfg.connect_timeout = secs("connect_timeout", v)?;
        }
        if let Some(v) = s.max_attempts {
            if v == 0 {
                return Err(ConfigError::Invalid {
                    field: "max_attempts",
                    reason: "must be at least 1".into(),
                });
            }
            cfg.max_attempts = v;
        }
        if let Some(b) = &s.backoff {
            let first = secs("backoff.first", b.first)?;
            let max = match b.max {
                Some(m) => secs("backoff.max", m)?,
                None => first,
            };
            if !b.factor.is_finite() || b.factor < 1.0 {
                return Err(ConfigError::Invalid {
                    field: "backoff.factor",
                    reason: format!("must be a finite number >= 1.0, got {}", b.factor),
                });
            }
            cfg.backoff = BackoffPolicy::exponential(first, b.factor, max).with_jitter(b.jitter);
        }
        if let Some(v) = s.poll_timeout {
            cfg.poll_timeout = secs("poll_timeout", v)?;
        }
        if let Some(a) = s.admission {
            cfg.admission = a;
        }
        if let Some(v) = s.grace {
            cfg.grace = secs("grace", v)?;
        }
        if let Some(v) = s.outbound_capacity {
            cfg.outbound_capacity = v;
        }
        if let Some(v) = s.history_len {
            cfg.history_len = v;
        }
        Ok(cfg)
    }

    /// Entities in file order.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.iter().map(EntitySpec::to_entity).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.entities {
            if spec.id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "entities.id",
                    reason: "must not be empty".into(),
                });
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(ConfigError::DuplicateEntity(spec.id.clone()));
            }
            let url = url::Url::parse(&spec.status_url).map_err(|e| ConfigError::InvalidUrl {
                id: spec.id.clone(),
                url: spec.status_url.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUrl {
                    id: spec.id.clone(),
                    url: spec.status_url.clone(),
                    reason: format!("unsupported scheme {:?}", url.scheme()),
                });
            }
        }
        self.config().map(|_| ())
    }
}

fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}
