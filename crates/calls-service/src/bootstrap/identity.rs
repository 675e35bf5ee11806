//! Host identity collaborator.
//!
//! The host owns user accounts and sessions. The calls service needs one
//! service account (the bot) with a long-lived session that backends use to
//! authenticate, plus an optional profile image.
//!
//! # Host REST contract
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | ensure account | `PUT /api/v1/service-accounts/{username}` `{display_name, description}` | `{id, username, created}` |
//! | create session | `POST /api/v1/sessions` `{user_id, expires_at: 0}` | `{id, token}` |
//! | revoke session | `DELETE /api/v1/sessions/{id}` | 2xx, 404 treated as revoked |
//! | profile image | `PUT /api/v1/service-accounts/{id}/image` raw bytes | 2xx |
//!
//! `PUT` on the account is create-if-absent on the host side; the caller still
//! serializes it under a cluster lock because hosts are not required to make it
//! atomic.

use crate::errors::CallsError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Account the bot is provisioned as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotAccountSpec {
    #[serde(skip)]
    pub username: String,
    pub display_name: String,
    pub description: String,
}

/// A service account as returned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotUser {
    #[serde(rename = "id")]
    pub user_id: UserId,
    pub username: String,
    /// Whether this call created the account.
    #[serde(default)]
    pub created: bool,
}

/// Long-lived bot session. Revoked on clean shutdown.
#[derive(Debug, Clone)]
pub struct BotSession {
    pub user_id: UserId,
    pub session_id: String,
    pub token: SecretString,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Create the account if absent, otherwise return the existing one.
    async fn ensure_bot_user(&self, spec: &BotAccountSpec) -> Result<BotUser, CallsError>;

    /// Mint a non-expiring session for `user_id`.
    async fn create_session(&self, user_id: &UserId) -> Result<BotSession, CallsError>;

    async fn revoke_session(&self, session_id: &str) -> Result<(), CallsError>;

    async fn set_profile_image(&self, user_id: &UserId, image: Vec<u8>) -> Result<(), CallsError>;
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    user_id: &'a UserId,
    /// Zero means the session never expires.
    expires_at: i64,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    token: SecretString,
}

/// REST client for the host identity API.
pub struct HttpIdentityClient {
    base_url: String,
    token: SecretString,
    http_client: reqwest::Client,
}

impl HttpIdentityClient {
    /// Build a client for `base_url` authenticating with a bearer `token`.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Config` if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, CallsError> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CallsError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response, operation: &str) -> Result<reqwest::Response, CallsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_else(|e| {
            trace!(target: "calls.identity", error = %e, "Failed to read error response body");
            "<failed to read body>".to_string()
        });
        warn!(
            target: "calls.identity",
            status = %status,
            operation = operation,
            "Identity host rejected request"
        );
        // Body may echo credentials; trace level only
        trace!(target: "calls.identity", body = %body, "Identity host error body");
        Err(CallsError::Identity(format!("{operation} failed with status {status}")))
    }

    fn request_failed(operation: &'static str) -> impl FnOnce(reqwest::Error) -> CallsError {
        move |e| {
            warn!(target: "calls.identity", error = %e, operation = operation, "HTTP request failed");
            CallsError::Identity(format!("{operation} request failed: {e}"))
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    #[instrument(skip_all, fields(username = %spec.username))]
    async fn ensure_bot_user(&self, spec: &BotAccountSpec) -> Result<BotUser, CallsError> {
        let response = self
            .http_client
            .put(self.url(&format!("/api/v1/service-accounts/{}", spec.username)))
            .bearer_auth(self.token.expose_secret())
            .json(spec)
            .send()
            .await
            .map_err(Self::request_failed("ensure_bot_user"))?;

        let user: BotUser = Self::check(response, "ensure_bot_user")
            .await?
            .json()
            .await
            .map_err(|e| CallsError::Identity(format!("Invalid account response: {e}")))?;

        debug!(
            target: "calls.identity",
            user_id = %user.user_id,
            created = user.created,
            "Bot account ensured"
        );
        Ok(user)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn create_session(&self, user_id: &UserId) -> Result<BotSession, CallsError> {
        let response = self
            .http_client
            .post(self.url("/api/v1/sessions"))
            .bearer_auth(self.token.expose_secret())
            .json(&CreateSessionRequest {
                user_id,
                expires_at: 0,
            })
            .send()
            .await
            .map_err(Self::request_failed("create_session"))?;

        let session: SessionResponse = Self::check(response, "create_session")
            .await?
            .json()
            .await
            .map_err(|e| CallsError::Identity(format!("Invalid session response: {e}")))?;

        Ok(BotSession {
            user_id: user_id.clone(),
            session_id: session.id,
            token: session.token,
        })
    }

    #[instrument(skip_all)]
    async fn revoke_session(&self, session_id: &str) -> Result<(), CallsError> {
        let response = self
            .http_client
            .delete(self.url(&format!("/api/v1/sessions/{session_id}")))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(Self::request_failed("revoke_session"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(target: "calls.identity", "Session already gone");
            return Ok(());
        }
        Self::check(response, "revoke_session").await?;
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn set_profile_image(&self, user_id: &UserId, image: Vec<u8>) -> Result<(), CallsError> {
        let response = self
            .http_client
            .put(self.url(&format!("/api/v1/service-accounts/{user_id}/image")))
            .bearer_auth(self.token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .map_err(Self::request_failed("set_profile_image"))?;

        Self::check(response, "set_profile_image").await?;
        Ok(())
    }
}
