//! External media daemon client.
//!
//! One WebSocket connection per node carries every call's signaling. Frames
//! are JSON [`DaemonFrame`]s. When the connection drops the client reconnects
//! with exponential backoff; outbound frames queue meanwhile. After the retry
//! budget is spent the event stream closes, which the relay treats as
//! backend termination.

use crate::backend::MediaBackend;
use crate::config::RtcdConfig;
use crate::errors::CallsError;
use crate::observability::metrics;
use crate::signaling::SignalingMessage;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::secret::ExposeSecret;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type DaemonStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum reconnection attempts before the daemon is declared gone.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum delay between attempts.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Bound on a single connection handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the client id this node registers as.
pub const CLIENT_ID_HEADER: &str = "x-calls-client-id";

const CHANNEL_BUFFER: usize = 1024;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame exchanged with the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DaemonFrame {
    Signal(SignalingMessage),
    Ping,
    Pong,
}

/// Connection retry settings.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Client for the external media daemon.
pub struct RtcdClientManager {
    client_id: String,
    outbound_tx: mpsc::Sender<SignalingMessage>,
    events_rx: Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

async fn open(config: &RtcdConfig, timeout: Duration) -> Result<DaemonStream, CallsError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| CallsError::Config(format!("Invalid media daemon URL: {e}")))?;

    let client_id = HeaderValue::from_str(&config.client_id)
        .map_err(|e| CallsError::Config(format!("Invalid media daemon client id: {e}")))?;
    request.headers_mut().insert(CLIENT_ID_HEADER, client_id);

    if let Some(key) = &config.auth_key {
        let credentials = STANDARD.encode(format!("{}:{}", config.client_id, key.expose_secret()));
        let value = HeaderValue::from_str(&format!("Basic {credentials}"))
            .map_err(|e| CallsError::Config(format!("Invalid media daemon auth key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CallsError::Backend(format!(
            "Media daemon connection failed: {e}"
        ))),
        Err(_) => Err(CallsError::Backend(
            "Media daemon connection timed out".to_string(),
        )),
    }
}

impl RtcdClientManager {
    /// Connect with the default reconnect policy.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Backend` if the daemon cannot be reached. There is
    /// no fallback to the embedded engine.
    pub async fn connect(
        config: RtcdConfig,
        cancel_token: CancellationToken,
    ) -> Result<Arc<Self>, CallsError> {
        Self::connect_with(config, ReconnectPolicy::default(), cancel_token).await
    }

    /// Connect with an explicit reconnect policy.
    ///
    /// # Errors
    ///
    /// See [`RtcdClientManager::connect`].
    #[instrument(skip_all, name = "calls.backend.rtcd.connect", fields(client_id = %config.client_id))]
    pub async fn connect_with(
        config: RtcdConfig,
        policy: ReconnectPolicy,
        cancel_token: CancellationToken,
    ) -> Result<Arc<Self>, CallsError> {
        let stream = match open(&config, policy.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                metrics::record_backend_connect("failed");
                error!(target: "calls.backend.rtcd", error = %e, "Failed to connect to media daemon");
                return Err(e);
            }
        };
        metrics::record_backend_connect("connected");
        info!(target: "calls.backend.rtcd", client_id = %config.client_id, "Connected to media daemon");

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        let manager = Arc::new(Self {
            client_id: config.client_id.clone(),
            outbound_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: Arc::clone(&connected),
            cancel_token: cancel_token.clone(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run_connection(
            config,
            policy,
            stream,
            outbound_rx,
            events_tx,
            connected,
            cancel_token,
        ));
        *manager.task.lock().await = Some(task);

        Ok(manager)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the WebSocket is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaBackend for RtcdClientManager {
    fn kind(&self) -> &'static str {
        "rtcd"
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallsError> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| CallsError::BackendTerminated)
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<SignalingMessage>> {
        self.events_rx.lock().await.take()
    }

    async fn stop(&self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(target: "calls.backend.rtcd", "Media daemon connection did not close in time");
            }
        }
        info!(target: "calls.backend.rtcd", "Media daemon client stopped");
    }
}

/// Why a connection ended.
enum Disconnect {
    /// Transport failure or daemon close; reconnect.
    Lost(String),
    /// Cancelled or every handle dropped; exit.
    Shutdown,
}

async fn run_connection(
    config: RtcdConfig,
    policy: ReconnectPolicy,
    mut stream: DaemonStream,
    mut outbound_rx: mpsc::Receiver<SignalingMessage>,
    events_tx: mpsc::Sender<SignalingMessage>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    loop {
        let reason = pump(&mut stream, &mut outbound_rx, &events_tx, &cancel_token).await;
        connected.store(false, Ordering::Relaxed);

        let Disconnect::Lost(reason) = reason else {
            let _ = stream.close(None).await;
            debug!(target: "calls.backend.rtcd", "Media daemon connection closed");
            return;
        };
        warn!(target: "calls.backend.rtcd", reason = %reason, "Media daemon connection lost");

        match reconnect(&config, &policy, &cancel_token).await {
            Some(new_stream) => {
                stream = new_stream;
                connected.store(true, Ordering::Relaxed);
            }
            None if cancel_token.is_cancelled() => return,
            None => {
                metrics::record_backend_connect("exhausted");
                error!(
                    target: "calls.backend.rtcd",
                    attempts = policy.max_attempts,
                    "Media daemon unreachable, giving up"
                );
                // Dropping events_tx closes the event stream
                return;
            }
        }
    }
}

async fn pump(
    stream: &mut DaemonStream,
    outbound_rx: &mut mpsc::Receiver<SignalingMessage>,
    events_tx: &mpsc::Sender<SignalingMessage>,
    cancel_token: &CancellationToken,
) -> Disconnect {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => return Disconnect::Shutdown,

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    return Disconnect::Shutdown;
                };
                let text = match serde_json::to_string(&DaemonFrame::Signal(message)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "calls.backend.rtcd", error = %e, "Failed to encode signaling frame");
                        continue;
                    }
                };
                if let Err(e) = stream.send(Message::Text(text)).await {
                    return Disconnect::Lost(e.to_string());
                }
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<DaemonFrame>(&text) {
                    Ok(DaemonFrame::Signal(message)) => {
                        if events_tx.send(message).await.is_err() {
                            return Disconnect::Shutdown;
                        }
                    }
                    Ok(DaemonFrame::Ping) => {
                        let pong = serde_json::to_string(&DaemonFrame::Pong).unwrap_or_default();
                        if let Err(e) = stream.send(Message::Text(pong)).await {
                            return Disconnect::Lost(e.to_string());
                        }
                    }
                    Ok(DaemonFrame::Pong) => {}
                    Err(e) => {
                        warn!(target: "calls.backend.rtcd", error = %e, "Dropping malformed daemon frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Disconnect::Lost("closed by daemon".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Disconnect::Lost(e.to_string()),
            }
        }
    }
}

async fn reconnect(
    config: &RtcdConfig,
    policy: &ReconnectPolicy,
    cancel_token: &CancellationToken,
) -> Option<DaemonStream> {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff(attempt);
        tokio::select! {
            () = cancel_token.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        match open(config, policy.connect_timeout).await {
            Ok(stream) => {
                metrics::record_backend_connect("connected");
                info!(target: "calls.backend.rtcd", attempt = attempt, "Reconnected to media daemon");
                return Some(stream);
            }
            Err(e) => {
                metrics::record_backend_connect("failed");
                warn!(
                    target: "calls.backend.rtcd",
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Media daemon reconnect failed"
                );
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::MessageKind;
    use common::secret::SecretString;
    use common::types::{CallId, SessionId, UserId};
    use tokio::net::TcpListener;

    fn config(url: String) -> RtcdConfig {
        RtcdConfig {
            url,
            client_id: "node-a".to_string(),
            auth_key: Some(SecretString::from("daemon-key")),
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn join() -> SignalingMessage {
        SignalingMessage::from_client(
            CallId::from("call-1"),
            SessionId::from("sess-1"),
            UserId::from("user-1"),
            MessageKind::Join,
            "",
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_frame_wire_format() {
        let json = serde_json::to_string(&DaemonFrame::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let json = serde_json::to_string(&DaemonFrame::Signal(join())).unwrap();
        assert!(json.starts_with(r#"{"type":"signal","data":{"#));
        let back: DaemonFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DaemonFrame::Signal(join()));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RtcdClientManager::connect_with(
            config(format!("ws://{addr}")),
            fast_policy(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CallsError::Backend(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let result = RtcdClientManager::connect_with(
            config("not a url".to_string()),
            fast_policy(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CallsError::Config(_))));
    }

    #[tokio::test]
    async fn test_signal_round_trip_and_auth_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let daemon = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut auth = None;
            let mut ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                 resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    auth = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Ok(resp)
                },
            )
            .await
            .unwrap();

            // Echo the first signal back as a reply
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                if let Ok(DaemonFrame::Signal(msg)) = serde_json::from_str(&text) {
                    let reply = DaemonFrame::Signal(msg.reply(MessageKind::Sdp, "v=0"));
                    ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                        .await
                        .unwrap();
                    break;
                }
            }
            auth
        });

        let client = RtcdClientManager::connect_with(
            config(format!("ws://{addr}")),
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(client.is_connected());
        let mut events = client.take_events().await.unwrap();

        client.send(join()).await.unwrap();
        let reply = events.recv().await.unwrap();
        assert_eq!(reply.kind, MessageKind::Sdp);
        assert_eq!(reply.payload, "v=0");

        let auth = daemon.await.unwrap().unwrap();
        assert_eq!(
            auth,
            format!("Basic {}", STANDARD.encode("node-a:daemon-key"))
        );
        client.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_close_event_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.close(None).await.unwrap();
            // Listener dropped here; every reconnect is refused
        });

        let client = RtcdClientManager::connect_with(
            config(format!("ws://{addr}")),
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut events = client.take_events().await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(join()).await,
            Err(CallsError::BackendTerminated)
        ));
    }
}
