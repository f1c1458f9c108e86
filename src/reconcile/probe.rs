//! # Status probes: how an entity is asked for its live version.
//!
//! [`StatusProbe`] is the seam between the reconciliation loop and the outside
//! world. The loop only ever sees `Ok(Observed)` or a [`ProbeError`]; transport
//! details stay behind the trait.
//!
//! [`HttpProbe`] is the production implementation: a `GET` on the entity's
//! `status_url` that expects a JSON object with at least a `version` field.
//!
//! ```text
//! GET {status_url}            Accept: application/json
//!   2xx {"version": "v2", "title": "GKE", ...}  ──► Ok(Observed { version: "v2", title: Some("GKE") })
//!   2xx {"title": "GKE"}                        ──► Err(MissingVersion)
//!   2xx <html>                                  ──► Err(Decode)
//!   503                                         ──► Err(Status { code: 503 })
//!   (no answer within timeout)                  ──► Err(Timeout)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::error::ProbeError;
use crate::registry::Entity;

/// What a successful status query reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed {
    /// Live version.
    pub version: String,
    /// Display name reported by the entity, if any.
    pub title: Option<String>,
}

impl Observed {
    /// Observation carrying only a version.
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            title: None,
        }
    }

    /// Extracts an observation from a status body.
    ///
    /// `version` may be a string or a number; anything else counts as missing.
    pub fn from_json(body: &Value) -> Result<Self, ProbeError> {
        let obj = body.as_object().ok_or_else(|| ProbeError::Decode {
            reason: "status body is not a JSON object".to_string(),
        })?;

        let version = match obj.get("version") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ProbeError::MissingVersion),
        };
        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self { version, title })
    }
}

/// Asks one entity for its live state.
///
/// Implementations must not retry internally: the reconciliation loop owns the
/// attempt budget.
#[async_trait]
pub trait StatusProbe: Send + Sync + 'static {
    /// Performs exactly one status query.
    async fn probe(&self, entity: &Entity) -> Result<Observed, ProbeError>;
}

/// HTTP(S) implementation of [`StatusProbe`].
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpProbe {
    /// Builds a probe whose requests are bounded by `timeout` (`None` = unbounded).
    pub fn new(timeout: Option<Duration>) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(t) = timeout.filter(|d| !d.is_zero()) {
            builder = builder.timeout(t);
        }
        let client = builder.build()?;

        Ok(Self { client, timeout })
    }

    /// Wraps an already configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }
}

#[async_trait]
impl StatusProbe for HttpProbe {
    async fn probe(&self, entity: &Entity) -> Result<Observed, ProbeError> {
        let response = self
            .client
            .get(&entity.status_url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                code: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.map_err(e))?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| ProbeError::Decode {
            reason: e.to_string(),
        })?;
        Observed::from_json(&body)
    }
}

impl HttpProbe {
    fn map_err(&self, err: reqwest::Error) -> ProbeError {
        match self.timeout {
            Some(timeout) if err.is_timeout() => ProbeError::Timeout { timeout },
            _ => ProbeError::from(err),
        }
    }
}
