//! Service activation and deactivation.
//!
//! # Activation
//!
//! 1. Abort if disabled by environment flag
//! 2. Connect the coordination store
//! 3. Single handler: clean up call state from before this incarnation
//! 4. Ensure the bot account and create this process's bot session
//! 5. Best effort: set the bot profile image
//! 6. Recording licensed and enabled: spawn the job service check, which never
//!    aborts activation
//! 7. Select and start the media backend (daemon mode: clean up all ownership)
//! 8. Start the signaling relay
//! 9. Start the cluster event handler
//! 10. Announce presence and start the heartbeat
//! 11. Mark ready
//!
//! A failure at any step undoes the completed steps (stop the backend, revoke
//! the bot session) and returns the error; the node never becomes ready.
//!
//! # Deactivation
//!
//! Every step logs and continues on error so a failing collaborator cannot
//! block shutdown.

use crate::backend::{MediaBackendMode, MediaBackendSelector};
use crate::bootstrap::{
    BotIdentityProvisioner, BotSession, CleanupScope, ClusterStateReconciler, HttpIdentityClient,
    HttpJobServiceClient, IdentityService, JobService,
};
use crate::cluster::{
    start_presence_heartbeat, ClusterEventHandler, CoordinationStore, DistributedMutex,
    MemoryCoordinationStore, MutexConfig, NodePresence, RedisCoordinationStore,
};
use crate::config::Config;
use crate::errors::CallsError;
use crate::observability::HealthState;
use crate::ownership::NodeOwnershipTracker;
use crate::relay::{RelayConfig, RelayDeps, SignalingRelay};
use crate::transport::ClientTransport;
use common::secret::ExposeSecret;
use common::types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Bound on waiting for each background task at shutdown.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborators supplied by the host process. Unset collaborators are built
/// from configuration.
pub struct ServiceDeps {
    pub transport: Arc<dyn ClientTransport>,
    pub health: Arc<HealthState>,
    pub identity: Option<Arc<dyn IdentityService>>,
    pub store: Option<Arc<dyn CoordinationStore>>,
    pub jobs: Option<Arc<dyn JobService>>,
}

impl ServiceDeps {
    #[must_use]
    pub fn new(transport: Arc<dyn ClientTransport>, health: Arc<HealthState>) -> Self {
        Self {
            transport,
            health,
            identity: None,
            store: None,
            jobs: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn IdentityService>) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: Arc<dyn JobService>) -> Self {
        self.jobs = Some(jobs);
        self
    }
}

/// An activated node.
pub struct CallsService {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    mode: MediaBackendMode,
    tracker: Arc<NodeOwnershipTracker>,
    relay: Arc<SignalingRelay>,
    reconciler: Arc<ClusterStateReconciler>,
    presence: Arc<NodePresence>,
    bot: BotIdentityProvisioner,
    bot_session: BotSession,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

async fn connect_store(config: &Config) -> Result<Arc<dyn CoordinationStore>, CallsError> {
    match &config.coordination_url {
        Some(url) => {
            let store = RedisCoordinationStore::connect(url.expose_secret()).await?;
            info!(target: "calls.service", "Coordination store connected");
            Ok(Arc::new(store))
        }
        None => {
            warn!(
                target: "calls.service",
                "No coordination store configured, using in-process store (single node only)"
            );
            Ok(Arc::new(MemoryCoordinationStore::new()))
        }
    }
}

fn job_service(
    config: &Config,
    injected: Option<Arc<dyn JobService>>,
    session: &BotSession,
) -> Option<Arc<dyn JobService>> {
    if let Some(jobs) = injected {
        return Some(jobs);
    }
    let Some(url) = config.job_service_url.as_deref() else {
        warn!(target: "calls.service", "Recordings enabled but no job service URL configured");
        return None;
    };
    match HttpJobServiceClient::new(url, session.token.clone()) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            error!(target: "calls.service", error = %e, "Failed to build job service client");
            None
        }
    }
}

/// Check the job service in the background. Failure leaves recording
/// unavailable and is otherwise ignored.
async fn init_job_service(jobs: Arc<dyn JobService>, cancel_token: CancellationToken) {
    tokio::select! {
        () = cancel_token.cancelled() => {}
        result = jobs.init() => match result {
            Ok(()) => debug!(target: "calls.service", "Job service initialized"),
            Err(e) => error!(target: "calls.service", error = %e, "Failed to initialize job service"),
        },
    }
}

/// Undo a partial activation.
async fn unwind(
    bot: &BotIdentityProvisioner,
    session: &BotSession,
    mode: Option<&MediaBackendMode>,
    cancel_token: &CancellationToken,
) {
    cancel_token.cancel();
    if let Some(mode) = mode {
        mode.backend().stop().await;
    }
    if let Err(e) = bot.revoke(session).await {
        warn!(target: "calls.service", error = %e, "Failed to revoke bot session while aborting activation");
    }
}

impl CallsService {
    /// Run activation.
    ///
    /// # Errors
    ///
    /// Any error aborts activation. See the module docs for the step order.
    #[instrument(skip_all, name = "calls.service.activate", fields(node_id = %config.node_id))]
    pub async fn activate(config: &Config, deps: ServiceDeps) -> Result<Self, CallsError> {
        if config.disabled {
            warn!(target: "calls.service", "Calls disabled by environment flag, not activating");
            return Err(CallsError::Disabled);
        }

        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let node_id = config.node_id.clone();

        let store = match deps.store {
            Some(store) => store,
            None => connect_store(config).await?,
        };
        let mutex = DistributedMutex::new(
            Arc::clone(&store),
            node_id.clone(),
            MutexConfig::with_lease(config.lock_lease),
        );

        let reconciler = Arc::new(ClusterStateReconciler::new(
            Arc::clone(&store),
            mutex.clone(),
            node_id.clone(),
            config.lock_timeout,
            config.single_handler,
        ));
        reconciler
            .clean_up(CleanupScope::PreIncarnation { started_at_ms })
            .await
            .map_err(|e| {
                error!(target: "calls.service", error = %e, "Startup cleanup failed");
                e
            })?;

        let identity: Arc<dyn IdentityService> = match deps.identity {
            Some(identity) => identity,
            None => Arc::new(HttpIdentityClient::new(
                &config.host_api_url,
                config.host_api_token.clone(),
            )?),
        };
        let bot = BotIdentityProvisioner::new(identity, mutex, config.lock_timeout);
        let bot_session = bot.ensure_bot_session().await.map_err(|e| {
            error!(target: "calls.service", error = %e, "Failed to ensure bot session");
            e
        })?;
        bot.set_profile_image(&bot_session, config.bot_icon_path.as_deref())
            .await;

        let cancel_token = CancellationToken::new();
        let mut tasks = Vec::new();

        if config.license.recording_allowed && config.enable_recordings {
            if let Some(jobs) = job_service(config, deps.jobs, &bot_session) {
                tasks.push(tokio::spawn(init_job_service(
                    jobs,
                    cancel_token.child_token(),
                )));
            }
        }

        let mode = match MediaBackendSelector::select(config, cancel_token.child_token()).await {
            Ok(mode) => mode,
            Err(e) => {
                error!(target: "calls.service", error = %e, "Media backend failed to start");
                unwind(&bot, &bot_session, None, &cancel_token).await;
                return Err(e);
            }
        };

        if mode.daemon().is_some() {
            // Embedded ownership bookkeeping is meaningless once the daemon hosts calls
            if let Err(e) = reconciler.clean_up(CleanupScope::AllOwnership).await {
                warn!(target: "calls.service", error = %e, "Ownership cleanup for daemon mode failed");
            }
        }

        let tracker = Arc::new(NodeOwnershipTracker::new(
            node_id.clone(),
            Arc::clone(&store),
            mode.ownership_mode(),
        ));

        let relay = SignalingRelay::new(
            RelayDeps {
                backend: mode.backend(),
                tracker: Arc::clone(&tracker),
                store: Arc::clone(&store),
                transport: deps.transport,
                health: Arc::clone(&deps.health),
            },
            RelayConfig {
                queue_capacity: config.session_queue_capacity,
                write_timeout: config.client_write_timeout,
            },
            cancel_token.child_token(),
        );
        if let Err(e) = relay.start().await {
            error!(target: "calls.service", error = %e, "Signaling relay failed to start");
            unwind(&bot, &bot_session, Some(&mode), &cancel_token).await;
            return Err(e);
        }

        let handler = Arc::new(
            ClusterEventHandler::new(
                Arc::clone(&store),
                Arc::clone(&tracker),
                Arc::clone(&reconciler),
            )
            .with_relay(Arc::clone(&relay)),
        );
        tasks.push(tokio::spawn(handler.run(cancel_token.child_token())));

        let presence = Arc::new(NodePresence::new(
            node_id.clone(),
            Arc::clone(&store),
            Arc::clone(&reconciler),
            config.presence_interval,
        ));
        if let Err(e) = presence.beat().await {
            error!(target: "calls.service", error = %e, "Failed to announce node presence");
            relay.shutdown().await;
            unwind(&bot, &bot_session, Some(&mode), &cancel_token).await;
            return Err(e);
        }
        tasks.push(tokio::spawn(start_presence_heartbeat(
            Arc::clone(&presence),
            cancel_token.child_token(),
        )));

        deps.health.set_ready();
        info!(
            target: "calls.service",
            node_id = %node_id,
            backend = mode.as_label(),
            single_handler = config.single_handler,
            "Calls service activated"
        );

        Ok(Self {
            node_id,
            store,
            mode,
            tracker,
            relay,
            reconciler,
            presence,
            bot,
            bot_session,
            health: deps.health,
            cancel_token,
            tasks,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    #[must_use]
    pub fn mode(&self) -> &MediaBackendMode {
        &self.mode
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<NodeOwnershipTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    #[must_use]
    pub fn bot_session(&self) -> &BotSession {
        &self.bot_session
    }

    /// Shut the node down. Never fails; errors are logged.
    #[instrument(skip_all, name = "calls.service.deactivate", fields(node_id = %self.node_id))]
    pub async fn deactivate(self) {
        info!(target: "calls.service", "Deactivating calls service");
        self.health.set_not_ready();
        self.cancel_token.cancel();

        self.relay.shutdown().await;
        self.mode.backend().stop().await;

        for task in self.tasks {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
                warn!(target: "calls.service", "Background task did not stop in time");
            }
        }

        for call_id in self.tracker.owned_calls().await {
            if let Err(e) = self.tracker.release(&call_id).await {
                warn!(target: "calls.service", call_id = %call_id, error = %e, "Failed to release call ownership");
            }
        }
        if self.reconciler.is_single_handler() {
            if let Err(e) = self
                .reconciler
                .clean_up(CleanupScope::Node(self.node_id.clone()))
                .await
            {
                warn!(target: "calls.service", error = %e, "Shutdown cleanup failed");
            }
        }

        if let Err(e) = self.presence.leave().await {
            warn!(target: "calls.service", error = %e, "Failed to withdraw node presence");
        }

        if let Err(e) = self.bot.revoke(&self.bot_session).await {
            warn!(target: "calls.service", error = %e, "Failed to revoke bot session");
        }

        info!(target: "calls.service", "Calls service deactivated");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::TransportHub;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_disabled_flag_aborts_before_side_effects() {
        let vars = HashMap::from([
            ("CALLS_HOST_API_TOKEN".to_string(), "t".to_string()),
            ("CALLS_DISABLE".to_string(), "true".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();
        let store = Arc::new(MemoryCoordinationStore::new());
        let health = Arc::new(HealthState::new());

        let result = CallsService::activate(
            &config,
            ServiceDeps::new(Arc::new(TransportHub::new(8)), Arc::clone(&health))
                .with_store(Arc::clone(&store) as Arc<dyn CoordinationStore>),
        )
        .await;

        assert!(matches!(result, Err(CallsError::Disabled)));
        assert!(!health.is_ready());
        assert!(store.live_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_identity_host_aborts_activation() {
        let vars = HashMap::from([
            ("CALLS_HOST_API_TOKEN".to_string(), "t".to_string()),
            ("CALLS_HOST_API_URL".to_string(), "http://127.0.0.1:1".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();
        let health = Arc::new(HealthState::new());

        let result = CallsService::activate(
            &config,
            ServiceDeps::new(Arc::new(TransportHub::new(8)), Arc::clone(&health)),
        )
        .await;

        assert!(matches!(result, Err(CallsError::Identity(_))));
        assert!(!health.is_ready());
    }
}
