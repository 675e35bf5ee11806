//! Calls service configuration.
//!
//! Configuration is loaded from environment variables. The values are treated
//! as already validated by the host; parsing only rejects values that cannot
//! be represented at all (bad addresses, malformed ICE server JSON). All
//! sensitive fields are redacted in Debug output.

use common::secret::SecretString;
use common::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Default client WebSocket bind address.
pub const DEFAULT_WS_BIND_ADDRESS: &str = "0.0.0.0:8065";

/// Default ICE port, shared by UDP and TCP.
pub const DEFAULT_ICE_PORT: u16 = 8443;

/// Default TURN credential lifetime in minutes (one day).
pub const DEFAULT_TURN_CREDENTIALS_EXPIRATION_MINUTES: u64 = 1440;

/// Default cluster lock lease in seconds.
pub const DEFAULT_LOCK_LEASE_SECONDS: u64 = 10;

/// Default bounded lock acquisition timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 20;

/// Default host API URL for the identity collaborator.
pub const DEFAULT_HOST_API_URL: &str = "http://localhost:8065";

/// Default per-session outbound queue capacity.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

/// Default bound on a single client transport write in milliseconds.
pub const DEFAULT_CLIENT_WRITE_TIMEOUT_MS: u64 = 2000;

/// Default node presence heartbeat interval in seconds.
pub const DEFAULT_PRESENCE_INTERVAL_SECONDS: u64 = 5;

/// Default node id prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "calls";

/// One ICE server entry as handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// STUN/TURN URLs (`stun:host:port`, `turn:host:port?transport=udp`).
    pub urls: Vec<String>,
    /// Static username, if the server has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Static credential, if the server has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Whether any URL of this entry points at a TURN server.
    #[must_use]
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// TURN credential settings for the embedded engine.
#[derive(Clone)]
pub struct TurnConfig {
    /// Static auth secret shared with the TURN server. `None` disables
    /// server-side credential generation.
    pub static_auth_secret: Option<SecretString>,
    /// Lifetime of generated credentials; also the rotation interval.
    pub credentials_expiration: Duration,
}

impl fmt::Debug for TurnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnConfig")
            .field(
                "static_auth_secret",
                &self.static_auth_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("credentials_expiration", &self.credentials_expiration)
            .finish()
    }
}

/// Embedded media engine configuration.
#[derive(Debug, Clone)]
pub struct RtcServerConfig {
    /// ICE UDP bind address.
    pub ice_address_udp: IpAddr,
    /// ICE UDP bind port.
    pub ice_port_udp: u16,
    /// ICE TCP bind address.
    pub ice_address_tcp: IpAddr,
    /// ICE TCP bind port.
    pub ice_port_tcp: u16,
    /// Advertised host for host candidates (public IP or hostname).
    pub ice_host_override: Option<String>,
    /// Advertised port for host candidates.
    pub ice_host_port_override: Option<u16>,
    /// ICE servers announced to clients.
    pub ice_servers: Vec<IceServerConfig>,
    /// TURN credential generation.
    pub turn: TurnConfig,
    /// Bind the unspecified IPv6 address instead of IPv4 when the configured
    /// address is unspecified.
    pub enable_ipv6: bool,
    /// Number of UDP socket workers.
    pub udp_sockets_count: usize,
}

/// External media daemon connection settings.
#[derive(Clone)]
pub struct RtcdConfig {
    /// WebSocket URL of the daemon.
    pub url: String,
    /// Client id this node authenticates as.
    pub client_id: String,
    /// Auth key registered for the client id.
    pub auth_key: Option<SecretString>,
}

impl fmt::Debug for RtcdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcdConfig")
            .field("url", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Licensed capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct License {
    /// Whether use of the external media daemon is licensed.
    pub rtcd_allowed: bool,

    /// Whether call recording is licensed.
    pub recording_allowed: bool,
}

/// Calls service configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// When set, activation aborts before any side effect.
    pub disabled: bool,

    /// Coordination store URL. `None` selects the in-process store, which is
    /// only correct for single-node deployments.
    pub coordination_url: Option<SecretString>,

    /// Whether this node is the designated handler for cluster maintenance.
    pub single_handler: bool,

    /// Health endpoint bind address.
    pub health_bind_address: String,

    /// Client WebSocket endpoint bind address.
    pub ws_bind_address: String,

    /// Embedded engine settings (used only when the daemon is not selected).
    pub rtc: RtcServerConfig,

    /// External daemon settings; `None` when no URL is configured.
    pub rtcd: Option<RtcdConfig>,

    /// License entitlements.
    pub license: License,

    /// Operator switch for call recording. Takes effect only when licensed.
    pub enable_recordings: bool,

    /// Recording job service base URL.
    pub job_service_url: Option<String>,

    /// Cluster lock lease. Fixed for the process lifetime.
    pub lock_lease: Duration,

    /// Bounded cluster lock acquisition timeout.
    pub lock_timeout: Duration,

    /// Host API base URL for the identity collaborator.
    pub host_api_url: String,

    /// Host API bearer token.
    pub host_api_token: SecretString,

    /// Optional bot profile image path.
    pub bot_icon_path: Option<String>,

    /// Per-session outbound queue capacity.
    pub session_queue_capacity: usize,

    /// Bound on a single client write.
    pub client_write_timeout: Duration,

    /// Node presence heartbeat interval.
    pub presence_interval: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("node_id", &self.node_id)
            .field("disabled", &self.disabled)
            .field(
                "coordination_url",
                &self.coordination_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("single_handler", &self.single_handler)
            .field("health_bind_address", &self.health_bind_address)
            .field("ws_bind_address", &self.ws_bind_address)
            .field("rtc", &self.rtc)
            .field("rtcd", &self.rtcd)
            .field("license", &self.license)
            .field("enable_recordings", &self.enable_recordings)
            .field("job_service_url", &self.job_service_url)
            .field("lock_lease", &self.lock_lease)
            .field("lock_timeout", &self.lock_timeout)
            .field("host_api_url", &self.host_api_url)
            .field("host_api_token", &"[REDACTED]")
            .field("bot_icon_path", &self.bot_icon_path)
            .field("session_queue_capacity", &self.session_queue_capacity)
            .field("client_write_timeout", &self.client_write_timeout)
            .field("presence_interval", &self.presence_interval)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_bool(vars: &HashMap<String, String>, key: &str) -> bool {
    vars.get(key)
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

fn parse_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_addr(
    vars: &HashMap<String, String>,
    key: &str,
    default: IpAddr,
) -> Result<IpAddr, ConfigError> {
    match vars.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} is not an IP address"))),
        None => Ok(default),
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let host_api_token = SecretString::from(
            vars.get("CALLS_HOST_API_TOKEN")
                .ok_or_else(|| ConfigError::MissingEnvVar("CALLS_HOST_API_TOKEN".to_string()))?
                .clone(),
        );

        let node_id = non_empty(vars, "CALLS_NODE_ID").map_or_else(
            || {
                let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
                NodeId::generate(DEFAULT_NODE_ID_PREFIX, &hostname)
            },
            NodeId::from,
        );

        let coordination_url = non_empty(vars, "REDIS_URL").map(SecretString::from);

        // Single-node deployments are their own maintenance handler.
        let single_handler = vars
            .get("CALLS_SINGLE_HANDLER")
            .map_or(true, |_| parse_bool(vars, "CALLS_SINGLE_HANDLER"));

        let ice_servers = match non_empty(vars, "CALLS_ICE_SERVERS") {
            Some(raw) => serde_json::from_str::<Vec<IceServerConfig>>(&raw).map_err(|e| {
                ConfigError::InvalidValue(format!("CALLS_ICE_SERVERS is not valid JSON: {e}"))
            })?,
            None => Vec::new(),
        };

        let server_side_turn = parse_bool(vars, "CALLS_SERVER_SIDE_TURN");
        let static_auth_secret = if server_side_turn {
            Some(SecretString::from(
                non_empty(vars, "CALLS_TURN_STATIC_AUTH_SECRET").ok_or_else(|| {
                    ConfigError::MissingEnvVar("CALLS_TURN_STATIC_AUTH_SECRET".to_string())
                })?,
            ))
        } else {
            None
        };

        let expiration_minutes = parse_or(
            vars,
            "CALLS_TURN_CREDENTIALS_EXPIRATION_MINUTES",
            DEFAULT_TURN_CREDENTIALS_EXPIRATION_MINUTES,
        );
        if expiration_minutes == 0 {
            return Err(ConfigError::InvalidValue(
                "CALLS_TURN_CREDENTIALS_EXPIRATION_MINUTES must be positive".to_string(),
            ));
        }

        let default_sockets = std::thread::available_parallelism().map_or(1, usize::from);
        let udp_sockets_count = parse_or(vars, "CALLS_UDP_SOCKETS_COUNT", default_sockets).max(1);

        let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let rtc = RtcServerConfig {
            ice_address_udp: parse_addr(vars, "CALLS_UDP_SERVER_ADDRESS", unspecified)?,
            ice_port_udp: parse_or(vars, "CALLS_UDP_SERVER_PORT", DEFAULT_ICE_PORT),
            ice_address_tcp: parse_addr(vars, "CALLS_TCP_SERVER_ADDRESS", unspecified)?,
            ice_port_tcp: parse_or(vars, "CALLS_TCP_SERVER_PORT", DEFAULT_ICE_PORT),
            ice_host_override: non_empty(vars, "CALLS_ICE_HOST_OVERRIDE"),
            ice_host_port_override: vars
                .get("CALLS_ICE_HOST_PORT_OVERRIDE")
                .and_then(|s| s.trim().parse().ok()),
            ice_servers,
            turn: TurnConfig {
                static_auth_secret,
                credentials_expiration: Duration::from_secs(expiration_minutes * 60),
            },
            enable_ipv6: parse_bool(vars, "CALLS_ENABLE_IPV6"),
            udp_sockets_count,
        };

        let rtcd = non_empty(vars, "CALLS_RTCD_URL").map(|url| RtcdConfig {
            url,
            client_id: non_empty(vars, "CALLS_RTCD_CLIENT_ID")
                .unwrap_or_else(|| node_id.to_string()),
            auth_key: non_empty(vars, "CALLS_RTCD_AUTH_KEY").map(SecretString::from),
        });

        let session_queue_capacity = parse_or(
            vars,
            "CALLS_SESSION_QUEUE_CAPACITY",
            DEFAULT_SESSION_QUEUE_CAPACITY,
        )
        .max(1);

        Ok(Config {
            node_id,
            disabled: parse_bool(vars, "CALLS_DISABLE"),
            coordination_url,
            single_handler,
            health_bind_address: non_empty(vars, "CALLS_HEALTH_BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string()),
            ws_bind_address: non_empty(vars, "CALLS_WS_BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_WS_BIND_ADDRESS.to_string()),
            rtc,
            rtcd,
            license: License {
                rtcd_allowed: parse_bool(vars, "CALLS_LICENSE_RTCD"),
                recording_allowed: parse_bool(vars, "CALLS_LICENSE_RECORDING"),
            },
            enable_recordings: parse_bool(vars, "CALLS_ENABLE_RECORDINGS"),
            job_service_url: non_empty(vars, "CALLS_JOB_SERVICE_URL"),
            lock_lease: Duration::from_secs(
                parse_or(vars, "CALLS_LOCK_LEASE_SECONDS", DEFAULT_LOCK_LEASE_SECONDS).max(1),
            ),
            lock_timeout: Duration::from_secs(parse_or(
                vars,
                "CALLS_LOCK_TIMEOUT_SECONDS",
                DEFAULT_LOCK_TIMEOUT_SECONDS,
            )),
            host_api_url: non_empty(vars, "CALLS_HOST_API_URL")
                .unwrap_or_else(|| DEFAULT_HOST_API_URL.to_string()),
            host_api_token,
            bot_icon_path: non_empty(vars, "CALLS_BOT_ICON_PATH"),
            session_queue_capacity,
            client_write_timeout: Duration::from_millis(parse_or(
                vars,
                "CALLS_CLIENT_WRITE_TIMEOUT_MS",
                DEFAULT_CLIENT_WRITE_TIMEOUT_MS,
            )),
            presence_interval: Duration::from_secs(
                parse_or(
                    vars,
                    "CALLS_PRESENCE_INTERVAL_SECONDS",
                    DEFAULT_PRESENCE_INTERVAL_SECONDS,
                )
                .max(1),
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "CALLS_HOST_API_TOKEN".to_string(),
            "host-token-123".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert!(config.node_id.as_str().starts_with("calls-"));
        assert!(!config.disabled);
        assert!(config.coordination_url.is_none());
        assert!(config.single_handler);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.ws_bind_address, DEFAULT_WS_BIND_ADDRESS);
        assert_eq!(config.rtc.ice_port_udp, DEFAULT_ICE_PORT);
        assert_eq!(config.rtc.ice_port_tcp, DEFAULT_ICE_PORT);
        assert!(config.rtc.ice_servers.is_empty());
        assert!(config.rtc.turn.static_auth_secret.is_none());
        assert_eq!(
            config.rtc.turn.credentials_expiration,
            Duration::from_secs(DEFAULT_TURN_CREDENTIALS_EXPIRATION_MINUTES * 60)
        );
        assert!(config.rtc.udp_sockets_count >= 1);
        assert!(config.rtcd.is_none());
        assert!(!config.license.rtcd_allowed);
        assert_eq!(
            config.lock_lease,
            Duration::from_secs(DEFAULT_LOCK_LEASE_SECONDS)
        );
        assert_eq!(
            config.lock_timeout,
            Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECONDS)
        );
        assert_eq!(config.host_api_url, DEFAULT_HOST_API_URL);
        assert_eq!(config.session_queue_capacity, DEFAULT_SESSION_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("CALLS_NODE_ID".to_string(), "node-a".to_string());
        vars.insert("REDIS_URL".to_string(), "redis://redis:6379".to_string());
        vars.insert("CALLS_SINGLE_HANDLER".to_string(), "false".to_string());
        vars.insert("CALLS_UDP_SERVER_ADDRESS".to_string(), "10.0.0.5".to_string());
        vars.insert("CALLS_UDP_SERVER_PORT".to_string(), "9443".to_string());
        vars.insert("CALLS_ICE_HOST_OVERRIDE".to_string(), "calls.example.com".to_string());
        vars.insert("CALLS_ICE_HOST_PORT_OVERRIDE".to_string(), "30443".to_string());
        vars.insert(
            "CALLS_ICE_SERVERS".to_string(),
            r#"[{"urls":["stun:stun.example.com:3478"]},{"urls":["turn:turn.example.com:3478"]}]"#
                .to_string(),
        );
        vars.insert("CALLS_SERVER_SIDE_TURN".to_string(), "true".to_string());
        vars.insert(
            "CALLS_TURN_STATIC_AUTH_SECRET".to_string(),
            "turn-secret".to_string(),
        );
        vars.insert(
            "CALLS_TURN_CREDENTIALS_EXPIRATION_MINUTES".to_string(),
            "60".to_string(),
        );
        vars.insert("CALLS_UDP_SOCKETS_COUNT".to_string(), "4".to_string());
        vars.insert("CALLS_LOCK_LEASE_SECONDS".to_string(), "30".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.node_id.as_str(), "node-a");
        assert_eq!(
            config.coordination_url.as_ref().unwrap().expose_secret(),
            "redis://redis:6379"
        );
        assert!(!config.single_handler);
        assert_eq!(config.rtc.ice_address_udp.to_string(), "10.0.0.5");
        assert_eq!(config.rtc.ice_port_udp, 9443);
        assert_eq!(
            config.rtc.ice_host_override.as_deref(),
            Some("calls.example.com")
        );
        assert_eq!(config.rtc.ice_host_port_override, Some(30443));
        assert_eq!(config.rtc.ice_servers.len(), 2);
        assert!(config.rtc.ice_servers.get(1).unwrap().is_turn());
        assert_eq!(
            config
                .rtc
                .turn
                .static_auth_secret
                .as_ref()
                .unwrap()
                .expose_secret(),
            "turn-secret"
        );
        assert_eq!(
            config.rtc.turn.credentials_expiration,
            Duration::from_secs(3600)
        );
        assert_eq!(config.rtc.udp_sockets_count, 4);
        assert_eq!(config.lock_lease, Duration::from_secs(30));
    }

    #[test]
    fn test_rtcd_configured_with_client_id_defaulting_to_node() {
        let mut vars = base_vars();
        vars.insert("CALLS_NODE_ID".to_string(), "node-b".to_string());
        vars.insert("CALLS_RTCD_URL".to_string(), "ws://rtcd:8045".to_string());
        vars.insert("CALLS_LICENSE_RTCD".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).unwrap();
        let rtcd = config.rtcd.unwrap();
        assert_eq!(rtcd.url, "ws://rtcd:8045");
        assert_eq!(rtcd.client_id, "node-b");
        assert!(rtcd.auth_key.is_none());
        assert!(config.license.rtcd_allowed);
    }

    #[test]
    fn test_empty_rtcd_url_means_not_configured() {
        let mut vars = base_vars();
        vars.insert("CALLS_RTCD_URL".to_string(), "   ".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.rtcd.is_none());
    }

    #[test]
    fn test_recordings_need_license_and_switch() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert!(!config.license.recording_allowed);
        assert!(!config.enable_recordings);
        assert!(config.job_service_url.is_none());

        let mut vars = base_vars();
        vars.insert("CALLS_LICENSE_RECORDING".to_string(), "true".to_string());
        vars.insert("CALLS_ENABLE_RECORDINGS".to_string(), "true".to_string());
        vars.insert(
            "CALLS_JOB_SERVICE_URL".to_string(),
            "http://jobs:4545".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.license.recording_allowed);
        assert!(!config.license.rtcd_allowed);
        assert!(config.enable_recordings);
        assert_eq!(config.job_service_url.as_deref(), Some("http://jobs:4545"));
    }

    #[test]
    fn test_disable_flag() {
        let mut vars = base_vars();
        vars.insert("CALLS_DISABLE".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.disabled);
    }

    #[test]
    fn test_from_vars_missing_host_token() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CALLS_HOST_API_TOKEN")
        );
    }

    #[test]
    fn test_server_side_turn_requires_secret() {
        let mut vars = base_vars();
        vars.insert("CALLS_SERVER_SIDE_TURN".to_string(), "true".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::MissingEnvVar(v)) if v == "CALLS_TURN_STATIC_AUTH_SECRET"
        ));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let mut vars = base_vars();
        vars.insert("CALLS_TCP_SERVER_ADDRESS".to_string(), "not-an-ip".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_invalid_ice_servers_rejected() {
        let mut vars = base_vars();
        vars.insert("CALLS_ICE_SERVERS".to_string(), "{not json".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_socket_count_clamped_to_one() {
        let mut vars = base_vars();
        vars.insert("CALLS_UDP_SOCKETS_COUNT".to_string(), "0".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.rtc.udp_sockets_count, 1);
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), "redis://:pw@redis:6379".to_string());
        vars.insert("CALLS_RTCD_URL".to_string(), "ws://user:pw@rtcd".to_string());
        vars.insert("CALLS_RTCD_AUTH_KEY".to_string(), "daemon-key".to_string());

        let config = Config::from_vars(&vars).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("redis://"));
        assert!(!debug_output.contains("host-token-123"));
        assert!(!debug_output.contains("daemon-key"));
        assert!(!debug_output.contains("user:pw"));
    }
}
