//! Recording job service collaborator.
//!
//! When recording is both licensed and enabled, activation spawns an
//! initializer that checks the job service is reachable and accepts the bot
//! credentials. The check is best effort: a failure is logged and recording
//! stays unavailable, but the node still serves calls.
//!
//! # REST contract
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | init | `GET /version` with the bot session as bearer token | 2xx `{version}` |

use crate::errors::CallsError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Default HTTP request timeout for the job service.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait JobService: Send + Sync {
    /// Prepare the job service for recording jobs.
    async fn init(&self) -> Result<(), CallsError>;
}

#[derive(Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: String,
}

/// REST client for the recording job service.
pub struct HttpJobServiceClient {
    base_url: String,
    token: SecretString,
    http_client: reqwest::Client,
}

impl HttpJobServiceClient {
    /// Build a client for `base_url` authenticating with the bot session token.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Config` if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, CallsError> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| CallsError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }
}

#[async_trait]
impl JobService for HttpJobServiceClient {
    #[instrument(skip_all, fields(base_url = %self.base_url))]
    async fn init(&self) -> Result<(), CallsError> {
        let response = self
            .http_client
            .get(format!("{}/version", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| CallsError::Jobs(format!("version request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "calls.jobs", status = %status, "Job service rejected request");
            return Err(CallsError::Jobs(format!(
                "version check failed with status {status}"
            )));
        }

        let body: VersionResponse = response.json().await.unwrap_or_else(|e| {
            trace!(target: "calls.jobs", error = %e, "Job service version body unreadable");
            VersionResponse {
                version: String::new(),
            }
        });
        debug!(target: "calls.jobs", version = %body.version, "Job service reachable");
        Ok(())
    }
}
