//! Control plane client
//!
//! The synchronizer talks to the control plane through the [`ControlPlane`]
//! trait; [`HttpControlPlane`] is the production implementation over
//! `reqwest`.
//!
//! # Endpoints
//!
//! ```text
//! PUT {base}/v1/agents/{instance_id}/liveness
//!     body: { "applicationId": "...", "instanceId": "..." }
//!
//! GET {base}/v1/applications/{application_id}/subscriptions?instance={instance_id}
//!     200: [ { "artifactQualifiedName": "...",
//!              "subscriptionTypes": ["TRACES", ...],
//!              "forceSubscription": false }, ... ]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Who this agent is, as far as the control plane is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub application_id: String,
    /// Unique per process
    pub instance_id: String,
}

impl AgentIdentity {
    pub fn new(application_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// Kinds of interest the control plane can declare on an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Metrics,
    Traces,
    Logs,
    Breakpoints,
    /// Anything this agent does not know about
    #[serde(other)]
    Unknown,
}

/// One desired-state entry from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Artifact key, `a.b.C.method(int,java.lang.String)`
    pub artifact_qualified_name: String,
    #[serde(default)]
    pub subscription_types: Vec<SubscriptionType>,
    #[serde(default)]
    pub force_subscription: bool,
}

impl Subscription {
    pub fn traces(key: impl Into<String>) -> Self {
        Self {
            artifact_qualified_name: key.into(),
            subscription_types: vec![SubscriptionType::Traces],
            force_subscription: false,
        }
    }

    /// Whether this entry asks for tracing, either explicitly or forced.
    pub fn wants_traces(&self) -> bool {
        self.force_subscription || self.subscription_types.contains(&SubscriptionType::Traces)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("control plane request timed out")]
    Timeout,
    #[error("control plane rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("control plane unreachable: {0}")]
    Unreachable(String),
    #[error("control plane returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("invalid control plane response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("control plane transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else if e.is_connect() {
            SyncError::Unreachable(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Keepalive so the control plane knows this instance is up.
    async fn register_liveness(&self, identity: &AgentIdentity) -> Result<(), SyncError>;

    /// The full desired subscription list for this instance.
    async fn fetch_subscriptions(&self, identity: &AgentIdentity)
        -> Result<Vec<Subscription>, SyncError>;
}

/// Client for the control plane's HTTP API
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpControlPlane {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - Control plane root, e.g. "https://spotlight.example.com"
    /// * `token` - Optional bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("spotlight/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check_status(url: &str, status: StatusCode) -> Result<(), SyncError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register_liveness(&self, identity: &AgentIdentity) -> Result<(), SyncError> {
        let url = format!("{}/v1/agents/{}/liveness", self.base_url, identity.instance_id);
        let response = self
            .authorize(self.client.put(&url).json(identity))
            .send()
            .await?;
        Self::check_status(&url, response.status())
    }

    async fn fetch_subscriptions(
        &self,
        identity: &AgentIdentity,
    ) -> Result<Vec<Subscription>, SyncError> {
        let url = format!(
            "{}/v1/applications/{}/subscriptions",
            self.base_url, identity.application_id
        );
        let response = self
            .authorize(
                self.client
                    .get(&url)
                    .query(&[("instance", identity.instance_id.as_str())]),
            )
            .send()
            .await?;
        Self::check_status(&url, response.status())?;

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
