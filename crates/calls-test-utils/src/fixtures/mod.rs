//! Configuration and message fixtures.

use calls_service::config::Config;
use calls_service::signaling::{MessageKind, SignalingMessage};
use common::types::{CallId, SessionId, UserId};
use std::collections::HashMap;

/// Builder over the environment variables `Config::from_vars` reads.
///
/// Defaults bind everything to loopback on ephemeral ports, use the
/// in-process coordination store and a single UDP socket.
#[derive(Debug, Clone)]
pub struct TestConfig {
    vars: HashMap<String, String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfig {
    #[must_use]
    pub fn new() -> Self {
        let vars = [
            ("CALLS_HOST_API_TOKEN", "test-host-token"),
            ("CALLS_HOST_API_URL", "http://127.0.0.1:9"),
            ("CALLS_NODE_ID", "node-test"),
            ("CALLS_UDP_SERVER_ADDRESS", "127.0.0.1"),
            ("CALLS_UDP_SERVER_PORT", "0"),
            ("CALLS_TCP_SERVER_ADDRESS", "127.0.0.1"),
            ("CALLS_TCP_SERVER_PORT", "0"),
            ("CALLS_UDP_SOCKETS_COUNT", "1"),
            ("CALLS_HEALTH_BIND_ADDRESS", "127.0.0.1:0"),
            ("CALLS_WS_BIND_ADDRESS", "127.0.0.1:0"),
            ("CALLS_LOCK_TIMEOUT_SECONDS", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { vars }
    }

    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn node_id(self, node_id: &str) -> Self {
        self.set("CALLS_NODE_ID", node_id)
    }

    #[must_use]
    pub fn single_handler(self, enabled: bool) -> Self {
        self.set("CALLS_SINGLE_HANDLER", enabled.to_string())
    }

    #[must_use]
    pub fn disabled(self) -> Self {
        self.set("CALLS_DISABLE", "true")
    }

    /// Point at a media daemon, optionally with the license to use it.
    #[must_use]
    pub fn rtcd(self, url: &str, licensed: bool) -> Self {
        self.set("CALLS_RTCD_URL", url)
            .set("CALLS_LICENSE_RTCD", licensed.to_string())
    }

    /// Set the recording license and the operator switch.
    #[must_use]
    pub fn recordings(self, licensed: bool, enabled: bool) -> Self {
        self.set("CALLS_LICENSE_RECORDING", licensed.to_string())
            .set("CALLS_ENABLE_RECORDINGS", enabled.to_string())
    }

    #[must_use]
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// # Panics
    ///
    /// Panics if the variables do not form a valid configuration.
    #[must_use]
    pub fn build(&self) -> Config {
        Config::from_vars(&self.vars).expect("test configuration must be valid")
    }
}

/// A client frame for `session_id` on `call_id`. The user id is derived from
/// the session id.
#[must_use]
pub fn client_message(call_id: &str, session_id: &str, kind: MessageKind) -> SignalingMessage {
    SignalingMessage::from_client(
        CallId::from(call_id),
        SessionId::from(session_id),
        UserId::from(format!("user-{session_id}")),
        kind,
        "",
    )
}

/// A backend frame for `session_id` on `call_id` with `payload`.
#[must_use]
pub fn backend_message(
    call_id: &str,
    session_id: &str,
    kind: MessageKind,
    payload: &str,
) -> SignalingMessage {
    client_message(call_id, session_id, MessageKind::Join).reply(kind, payload)
}
