//! # Deployment trigger client.
//!
//! Starting a rollout is not the reconciler's job: operators (or a UI) call the
//! deploy endpoint, the pipeline runs, and the core only ever sees the
//! resulting `build` / `entity-updated` messages on the bus.
//!
//! ```text
//! POST {endpoint}  {"gradient": ..., "font": ..., "ascii_font": ...}
//!   2xx  {"id": "b-1", "version": "v2", "create_time": "..."}  ──► Started(job)
//!   409  {"id": "b-0", ...} | anything                        ──► AlreadyInProgress(job?)
//!   else                                                      ──► Err(Status)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DeployError;

/// Parameters of a new rollout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Color gradient of the new build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient: Option<String>,
    /// Text font of the new build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    /// Banner font of the new build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ascii_font: Option<String>,
    /// Anything else the pipeline accepts.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A deployment job created by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Build identifier.
    pub id: String,
    /// Version the fleet will be asked to converge to.
    #[serde(default)]
    pub version: Option<String>,
    /// When the pipeline created the job.
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}

/// Result of a trigger call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A new job was created.
    Started(DeploymentJob),
    /// A job is already running; it is returned when the endpoint says which.
    AlreadyInProgress(Option<DeploymentJob>),
}

/// Starts deployments.
#[async_trait]
pub trait DeployTrigger: Send + Sync + 'static {
    /// Requests a new rollout.
    async fn trigger(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError>;
}

/// [`DeployTrigger`] calling an HTTP endpoint.
#[derive(Clone, Debug)]
pub struct HttpDeployTrigger {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpDeployTrigger {
    /// Client for `endpoint` (the full `.../deploy` URL).
    pub fn new(endpoint: url::Url, timeout: Option<Duration>) -> Result<Self, DeployError> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout.filter(|d| !d.is_zero()) {
            builder = builder.timeout(t);
        }
        Ok(Self {
            client: builder.build()?,
            endpoint,
        })
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl DeployTrigger for HttpDeployTrigger {
    async fn trigger(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status == StatusCode::CONFLICT {
            let job = serde_json::from_slice::<DeploymentJob>(&body).ok();
            tracing::info!(endpoint = %self.endpoint, job = ?job.as_ref().map(|j| &j.id), "deployment already in progress");
            return Ok(DeployOutcome::AlreadyInProgress(job));
        }
        if !status.is_success() {
            return Err(DeployError::Status {
                code: status.as_u16(),
            });
        }

        let job: DeploymentJob = serde_json::from_slice(&body)?;
        tracing::info!(endpoint = %self.endpoint, job = %job.id, version = ?job.version, "deployment started");
        Ok(DeployOutcome::Started(job))
    }
}
