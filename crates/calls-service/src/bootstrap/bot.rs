//! Bot identity provisioning.
//!
//! Every node runs activation, but the bot account must be created once.
//! `ensure_bot_session` serializes the create-if-absent under the
//! `ensure_bot` cluster lock and then mints a session for the caller, so N
//! concurrent nodes produce one account and N sessions.

use crate::bootstrap::identity::{BotAccountSpec, BotSession, IdentityService};
use crate::cluster::mutex::DistributedMutex;
use crate::errors::CallsError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Cluster lock guarding bot provisioning.
pub const BOT_LOCK: &str = "ensure_bot";

/// Well-known bot username.
pub const BOT_USERNAME: &str = "calls";

pub const BOT_DISPLAY_NAME: &str = "Calls";

pub const BOT_DESCRIPTION: &str = "Calls Bot";

pub struct BotIdentityProvisioner {
    identity: Arc<dyn IdentityService>,
    mutex: DistributedMutex,
    lock_timeout: Duration,
}

impl BotIdentityProvisioner {
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityService>,
        mutex: DistributedMutex,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            mutex,
            lock_timeout,
        }
    }

    #[must_use]
    pub fn account_spec() -> BotAccountSpec {
        BotAccountSpec {
            username: BOT_USERNAME.to_string(),
            display_name: BOT_DISPLAY_NAME.to_string(),
            description: BOT_DESCRIPTION.to_string(),
        }
    }

    /// Ensure the bot account exists and return a fresh non-expiring session.
    ///
    /// # Errors
    ///
    /// Any error is fatal to activation: lock timeout, store unavailability,
    /// or an identity host failure.
    #[instrument(skip_all, name = "calls.bootstrap.ensure_bot_session")]
    pub async fn ensure_bot_session(&self) -> Result<BotSession, CallsError> {
        let spec = Self::account_spec();
        let session = self
            .mutex
            .run_locked(BOT_LOCK, self.lock_timeout, || async {
                let user = self.identity.ensure_bot_user(&spec).await?;
                info!(
                    target: "calls.bootstrap.bot",
                    user_id = %user.user_id,
                    created = user.created,
                    "Bot account ready"
                );
                self.identity.create_session(&user.user_id).await
            })
            .await?;

        info!(
            target: "calls.bootstrap.bot",
            user_id = %session.user_id,
            session_id = %session.session_id,
            "Bot session created"
        );
        Ok(session)
    }

    /// Upload the bot profile image. Failures are logged and ignored.
    pub async fn set_profile_image(&self, session: &BotSession, icon_path: Option<&str>) {
        let Some(path) = icon_path else {
            return;
        };

        let image = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "calls.bootstrap.bot", error = %e, "Failed to read bot icon");
                return;
            }
        };

        if let Err(e) = self
            .identity
            .set_profile_image(&session.user_id, image)
            .await
        {
            warn!(target: "calls.bootstrap.bot", error = %e, "Failed to set bot profile image");
        }
    }

    /// Revoke a session created by this process.
    ///
    /// # Errors
    ///
    /// Returns the identity host error.
    pub async fn revoke(&self, session: &BotSession) -> Result<(), CallsError> {
        self.identity.revoke_session(&session.session_id).await?;
        info!(
            target: "calls.bootstrap.bot",
            session_id = %session.session_id,
            "Bot session revoked"
        );
        Ok(())
    }
}
