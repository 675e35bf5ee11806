//! In-memory host identity API.
//!
//! `ensure_bot_user` is deliberately a check-then-create with a yield point in
//! between, the way a host without an atomic upsert behaves. Concurrent
//! callers that are not serialized by a cluster lock create duplicate
//! accounts, which `accounts_created` exposes.

use async_trait::async_trait;
use calls_service::bootstrap::{BotAccountSpec, BotSession, BotUser, IdentityService};
use calls_service::errors::CallsError;
use common::secret::SecretString;
use common::types::UserId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct IdentityState {
    /// username -> every account created under it
    accounts: HashMap<String, Vec<UserId>>,
    sessions: HashMap<String, UserId>,
    revoked: HashSet<String>,
    images: Vec<(UserId, usize)>,
}

/// Mock identity host.
#[derive(Default)]
pub struct MockIdentityService {
    state: Mutex<IdentityState>,
    create_delay: Mutex<Option<Duration>>,
    fail_ensure: AtomicBool,
    fail_image: AtomicBool,
    ensure_calls: AtomicUsize,
}

impl MockIdentityService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between the existence check and the create, widening the race
    /// window for unserialized callers.
    #[must_use]
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.state_delay() = Some(delay);
        self
    }

    /// Make `ensure_bot_user` fail with an identity error.
    #[must_use]
    pub fn failing_ensure(self) -> Self {
        self.fail_ensure.store(true, Ordering::SeqCst);
        self
    }

    /// Make `set_profile_image` fail with an identity error.
    #[must_use]
    pub fn failing_image(self) -> Self {
        self.fail_image.store(true, Ordering::SeqCst);
        self
    }

    fn state_delay(&self) -> std::sync::MutexGuard<'_, Option<Duration>> {
        self.create_delay.lock().unwrap()
    }

    /// Number of accounts ever created under `username`.
    pub fn accounts_created(&self, username: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(username)
            .map_or(0, Vec::len)
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn is_revoked(&self, session_id: &str) -> bool {
        self.state.lock().unwrap().revoked.contains(session_id)
    }

    pub fn revoked_count(&self) -> usize {
        self.state.lock().unwrap().revoked.len()
    }

    /// Profile images set, as (user, byte length).
    pub fn images(&self) -> Vec<(UserId, usize)> {
        self.state.lock().unwrap().images.clone()
    }
}

#[async_trait]
impl IdentityService for MockIdentityService {
    async fn ensure_bot_user(&self, spec: &BotAccountSpec) -> Result<BotUser, CallsError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(CallsError::Identity("mock host unavailable".to_string()));
        }

        let existing = self
            .state
            .lock()
            .unwrap()
            .accounts
            .get(&spec.username)
            .and_then(|ids| ids.first().cloned());
        if let Some(user_id) = existing {
            return Ok(BotUser {
                user_id,
                username: spec.username.clone(),
                created: false,
            });
        }

        let delay = *self.state_delay();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let user_id = UserId::from(format!("user-{}", Uuid::new_v4().simple()));
        self.state
            .lock()
            .unwrap()
            .accounts
            .entry(spec.username.clone())
            .or_default()
            .push(user_id.clone());
        Ok(BotUser {
            user_id,
            username: spec.username.clone(),
            created: true,
        })
    }

    async fn create_session(&self, user_id: &UserId) -> Result<BotSession, CallsError> {
        let session_id = format!("session-{}", Uuid::new_v4().simple());
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(session_id.clone(), user_id.clone());
        Ok(BotSession {
            user_id: user_id.clone(),
            session_id,
            token: SecretString::from(format!("token-{}", Uuid::new_v4().simple())),
        })
    }

    async fn revoke_session(&self, session_id: &str) -> Result<(), CallsError> {
        self.state
            .lock()
            .unwrap()
            .revoked
            .insert(session_id.to_string());
        Ok(())
    }

    async fn set_profile_image(&self, user_id: &UserId, image: Vec<u8>) -> Result<(), CallsError> {
        if self.fail_image.load(Ordering::SeqCst) {
            return Err(CallsError::Identity("image rejected".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .images
            .push((user_id.clone(), image.len()));
        Ok(())
    }
}
