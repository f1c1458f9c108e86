//! Error types used by the fleetwatch runtime.
//!
//! - [`RuntimeError`]: errors raised by the runtime context itself (shutdown, wiring).
//! - [`ProbeError`]: a single failed query against an entity status endpoint.
//! - [`TransportError`]: failures surfaced by the real-time transport handle.
//! - [`DecodeError`]: a frame that could not be turned into a [`Message`](crate::Message).
//! - [`ConfigError`]: invalid or unreadable fleet configuration.
//! - [`DeployError`]: the deployment trigger client could not complete a request.
//!
//! Every enum provides `as_label()` returning a short stable snake_case label
//! for logs/metrics.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the fleetwatch runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some reconciliation tasks did not stop in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Entities whose reconciliation task was still running.
        stuck: Vec<String>,
    },

    /// A transport connection is already owned by this context.
    #[error("transport already connected to {uri}")]
    AlreadyConnected {
        /// URI of the live transport.
        uri: String,
    },

    /// The context was built outside of a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// Runtime could not be built from the supplied configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport could not be started.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Default status probe could not be built.
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use fleetwatch::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::AlreadyConnected { .. } => "runtime_already_connected",
            RuntimeError::NoRuntime => "runtime_no_runtime",
            RuntimeError::Config(e) => e.as_label(),
            RuntimeError::Transport(e) => e.as_label(),
            RuntimeError::Probe(e) => e.as_label(),
        }
    }
}

/// # A failed status query.
///
/// All variants are query faults: the reconciliation loop marks the entity as
/// degraded and keeps polling. None of them is terminal on its own.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Network-level failure (DNS, connect, reset, TLS).
    #[error("request failed: {reason}")]
    Request {
        /// Underlying error message.
        reason: String,
    },

    /// Endpoint answered with a non-2xx status.
    #[error("status endpoint returned {code}")]
    Status {
        /// HTTP status code.
        code: u16,
    },

    /// Body was not valid JSON (or not the expected object shape).
    #[error("malformed status body: {reason}")]
    Decode {
        /// Underlying error message.
        reason: String,
    },

    /// Body was JSON but carried no `version` field.
    #[error("status body has no version field")]
    MissingVersion,

    /// Query did not complete within the per-poll timeout.
    #[error("status query timed out after {timeout:?}")]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },
}

impl ProbeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use fleetwatch::ProbeError;
    ///
    /// assert_eq!(ProbeError::Status { code: 503 }.as_label(), "probe_status");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ProbeError::Request { .. } => "probe_request",
            ProbeError::Status { .. } => "probe_status",
            ProbeError::Decode { .. } => "probe_decode",
            ProbeError::MissingVersion => "probe_missing_version",
            ProbeError::Timeout { .. } => "probe_timeout",
        }
    }

    /// Indicates whether the fault is likely to clear without operator action.
    ///
    /// Client-side (4xx) statuses and malformed bodies usually point at a
    /// misconfigured status URL; they are still retried, but reported as
    /// non-transient so dashboards can tell them apart.
    pub fn is_transient(&self) -> bool {
        match self {
            ProbeError::Request { .. } | ProbeError::Timeout { .. } => true,
            ProbeError::Status { code } => *code >= 500 || *code == 429,
            ProbeError::Decode { .. } | ProbeError::MissingVersion => false,
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProbeError::Decode {
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ProbeError::Status {
                code: status.as_u16(),
            }
        } else {
            ProbeError::Request {
                reason: err.to_string(),
            }
        }
    }
}

/// # Errors surfaced by the transport handle.
///
/// Connection drops are never reported here: the connection loop recovers from
/// them on its own. Only caller-facing operations (`send`, startup) fail.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransportError {
    /// The URI is not a valid `ws://` / `wss://` URL.
    #[error("invalid transport uri {uri:?}: {reason}")]
    InvalidUri {
        /// Offending URI.
        uri: String,
        /// Parser message.
        reason: String,
    },

    /// No live connection right now; the message was not sent.
    #[error("transport is disconnected")]
    Disconnected,

    /// The outbound queue is full; the message was not sent.
    #[error("transport outbound queue is full")]
    Full,

    /// The connection loop has shut down for good.
    #[error("transport is closed")]
    Closed,

    /// The outbound message could not be serialized.
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::InvalidUri { .. } => "transport_invalid_uri",
            TransportError::Disconnected => "transport_disconnected",
            TransportError::Full => "transport_full",
            TransportError::Closed => "transport_closed",
            TransportError::Encode(_) => "transport_encode",
        }
    }
}

/// # Frame decoding failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame is not JSON or not an envelope object.
    #[error("frame is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope body does not match the shape required by its topic.
    #[error("body of topic {topic:?} has unexpected shape: {reason}")]
    Body {
        /// Topic named by the envelope.
        topic: String,
        /// Parser message.
        reason: String,
    },
}

impl DecodeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DecodeError::Json(_) => "decode_json",
            DecodeError::Body { .. } => "decode_body",
        }
    }
}

/// # Fleet configuration errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Fleet file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fleet file is not valid YAML or has the wrong shape.
    #[error("invalid fleet file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An entity status URL cannot be parsed.
    #[error("entity {id:?} has invalid status url {url:?}: {reason}")]
    InvalidUrl {
        /// Entity id.
        id: String,
        /// Offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// Two entities share the same id.
    #[error("duplicate entity id {0:?}")]
    DuplicateEntity(String),

    /// A setting is out of range.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Yaml(_) => "config_yaml",
            ConfigError::InvalidUrl { .. } => "config_invalid_url",
            ConfigError::DuplicateEntity(_) => "config_duplicate_entity",
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

/// # Deployment trigger errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DeployError {
    /// Request could not be sent or the connection failed.
    #[error("deploy request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Endpoint answered with a status other than 2xx / 409.
    #[error("deploy endpoint returned {code}")]
    Status {
        /// HTTP status code.
        code: u16,
    },

    /// Response body is not a deployment job.
    #[error("malformed deploy response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DeployError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeployError::Request(_) => "deploy_request",
            DeployError::Status { .. } => "deploy_status",
            DeployError::Decode(_) => "deploy_decode",
        }
    }
}
