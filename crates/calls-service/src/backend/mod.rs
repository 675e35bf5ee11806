//! Media backend selection.
//!
//! Exactly one backend is active per process: the embedded engine, or a
//! client for the external media daemon. The choice is made once during
//! activation and also decides whether call ownership is tracked at all.

pub mod embedded;
pub mod rtcd;
pub mod turn;

use crate::config::Config;
use crate::errors::CallsError;
use crate::ownership::OwnershipMode;
use crate::signaling::SignalingMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub use embedded::EmbeddedRtcServer;
pub use rtcd::RtcdClientManager;

/// A running media backend.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Hand a client frame to the backend.
    async fn send(&self, message: SignalingMessage) -> Result<(), CallsError>;

    /// Take the backend event stream. Returns `None` after the first call.
    /// The stream closing means the backend terminated.
    async fn take_events(&self) -> Option<mpsc::Receiver<SignalingMessage>>;

    /// Stop the backend and release its resources.
    async fn stop(&self);
}

/// Which backend was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Embedded,
    ExternalDaemon,
}

/// The active backend.
#[derive(Clone)]
pub enum MediaBackendMode {
    Embedded(Arc<EmbeddedRtcServer>),
    ExternalDaemon(Arc<RtcdClientManager>),
}

impl MediaBackendMode {
    #[must_use]
    pub fn backend(&self) -> Arc<dyn MediaBackend> {
        match self {
            MediaBackendMode::Embedded(server) => Arc::clone(server) as Arc<dyn MediaBackend>,
            MediaBackendMode::ExternalDaemon(client) => Arc::clone(client) as Arc<dyn MediaBackend>,
        }
    }

    #[must_use]
    pub fn choice(&self) -> BackendChoice {
        match self {
            MediaBackendMode::Embedded(_) => BackendChoice::Embedded,
            MediaBackendMode::ExternalDaemon(_) => BackendChoice::ExternalDaemon,
        }
    }

    /// Ownership is only tracked when calls are hosted by this cluster's nodes.
    #[must_use]
    pub fn ownership_mode(&self) -> OwnershipMode {
        match self.choice() {
            BackendChoice::Embedded => OwnershipMode::Active,
            BackendChoice::ExternalDaemon => OwnershipMode::Inert,
        }
    }

    #[must_use]
    pub fn as_label(&self) -> &'static str {
        self.backend().kind()
    }

    #[must_use]
    pub fn embedded(&self) -> Option<&Arc<EmbeddedRtcServer>> {
        match self {
            MediaBackendMode::Embedded(server) => Some(server),
            MediaBackendMode::ExternalDaemon(_) => None,
        }
    }

    #[must_use]
    pub fn daemon(&self) -> Option<&Arc<RtcdClientManager>> {
        match self {
            MediaBackendMode::Embedded(_) => None,
            MediaBackendMode::ExternalDaemon(client) => Some(client),
        }
    }
}

/// Chooses and starts the media backend.
pub struct MediaBackendSelector;

impl MediaBackendSelector {
    /// The daemon is used only when a URL is configured and the license
    /// allows it. A configured URL without the license is ignored.
    #[must_use]
    pub fn decide(config: &Config) -> BackendChoice {
        match (&config.rtcd, config.license.rtcd_allowed) {
            (Some(_), true) => BackendChoice::ExternalDaemon,
            _ => BackendChoice::Embedded,
        }
    }

    /// Start the selected backend.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Backend` if the daemon is selected but
    /// unreachable, or if the embedded engine cannot bind its sockets. Either
    /// is fatal; there is no fallback between backends.
    #[instrument(skip_all, name = "calls.backend.select")]
    pub async fn select(
        config: &Config,
        cancel_token: CancellationToken,
    ) -> Result<MediaBackendMode, CallsError> {
        let choice = Self::decide(config);
        if config.rtcd.is_some() && choice == BackendChoice::Embedded {
            info!(
                target: "calls.backend",
                "Media daemon configured but not licensed, using embedded engine"
            );
        }

        let mode = match (choice, &config.rtcd) {
            (BackendChoice::ExternalDaemon, Some(rtcd)) => MediaBackendMode::ExternalDaemon(
                RtcdClientManager::connect(rtcd.clone(), cancel_token).await?,
            ),
            _ => MediaBackendMode::Embedded(
                EmbeddedRtcServer::start(config.rtc.clone(), cancel_token).await?,
            ),
        };

        info!(target: "calls.backend", backend = mode.as_label(), "Media backend selected");
        Ok(mode)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RtcdConfig;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn config(rtcd_url: Option<&str>, licensed: bool) -> Config {
        let mut vars = HashMap::from([
            ("CALLS_HOST_API_TOKEN".to_string(), "t".to_string()),
            ("CALLS_NODE_ID".to_string(), "node-a".to_string()),
        ]);
        if let Some(url) = rtcd_url {
            vars.insert("CALLS_RTCD_URL".to_string(), url.to_string());
        }
        if licensed {
            vars.insert("CALLS_LICENSE_RTCD".to_string(), "true".to_string());
        }
        let mut config = Config::from_vars(&vars).unwrap();
        config.rtc.ice_address_udp = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.rtc.ice_address_tcp = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.rtc.ice_port_udp = 0;
        config.rtc.ice_port_tcp = 0;
        config.rtc.udp_sockets_count = 1;
        config
    }

    #[test]
    fn test_decide_requires_url_and_license() {
        assert_eq!(
            MediaBackendSelector::decide(&config(None, false)),
            BackendChoice::Embedded
        );
        assert_eq!(
            MediaBackendSelector::decide(&config(None, true)),
            BackendChoice::Embedded
        );
        assert_eq!(
            MediaBackendSelector::decide(&config(Some("ws://rtcd:8045"), false)),
            BackendChoice::Embedded
        );
        assert_eq!(
            MediaBackendSelector::decide(&config(Some("ws://rtcd:8045"), true)),
            BackendChoice::ExternalDaemon
        );
    }

    #[tokio::test]
    async fn test_unlicensed_daemon_url_starts_embedded() {
        let mode = MediaBackendSelector::select(
            &config(Some("ws://127.0.0.1:1"), false),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(mode.choice(), BackendChoice::Embedded);
        assert_eq!(mode.ownership_mode(), OwnershipMode::Active);
        assert_eq!(mode.as_label(), "embedded");
        assert!(mode.embedded().is_some());
        assert!(mode.daemon().is_none());
        mode.backend().stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_fatal_without_fallback() {
        let mut cfg = config(Some("ws://127.0.0.1:1"), true);
        cfg.rtcd = Some(RtcdConfig {
            url: "ws://127.0.0.1:1".to_string(),
            client_id: "node-a".to_string(),
            auth_key: None,
        });

        let result = MediaBackendSelector::select(&cfg, CancellationToken::new()).await;
        assert!(matches!(result, Err(CallsError::Backend(_))));
    }
}
