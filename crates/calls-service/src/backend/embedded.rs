//! Embedded media engine.
//!
//! Binds `udp_sockets_count` ICE UDP sockets on one address (`SO_REUSEPORT`,
//! one receive worker each) and the ICE TCP listener, keeps per-session signaling state, announces ICE
//! servers and host candidates to joining sessions, fans media-state changes
//! out to the other sessions of a call, and rotates TURN credentials.
//!
//! Media transport itself (DTLS, SRTP, congestion control) is outside this
//! engine; the sockets are owned here so the advertised candidates are real
//! and the ports are reserved for the process lifetime.

use crate::backend::{turn, MediaBackend};
use crate::config::{IceServerConfig, RtcServerConfig};
use crate::errors::CallsError;
use crate::observability::metrics;
use crate::signaling::{Direction, MessageKind, SignalingMessage};
use async_trait::async_trait;
use common::types::{CallId, SessionId, UserId};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Engine event buffer.
const EVENT_BUFFER: usize = 1024;

/// Largest datagram read by a UDP worker.
const UDP_RECV_BUFFER: usize = 1500;

/// Bound on waiting for engine tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Host candidate priorities (type preference 126 for UDP, 90 for TCP passive).
const UDP_HOST_PRIORITY: u32 = 2_130_706_431;
const TCP_HOST_PRIORITY: u32 = 1_518_280_447;

#[derive(Debug)]
struct HostedSession {
    call_id: CallId,
    user_id: UserId,
    remote_sdp: Option<String>,
    remote_candidates: Vec<String>,
}

/// In-process media engine.
pub struct EmbeddedRtcServer {
    config: RtcServerConfig,
    udp_addr: SocketAddr,
    udp_sockets: usize,
    tcp_addr: SocketAddr,
    sessions: RwLock<HashMap<SessionId, HostedSession>>,
    events_tx: RwLock<Option<mpsc::Sender<SignalingMessage>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    packets_received: Arc<AtomicU64>,
    tcp_connections: Arc<AtomicU64>,
}

fn bind_ip(addr: IpAddr, enable_ipv6: bool) -> IpAddr {
    if enable_ipv6 && addr == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        addr
    }
}

fn bind_udp_socket(addr: SocketAddr, reuse_port: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    #[cfg(unix)]
    socket.set_reuse_port(reuse_port)?;
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Bind `count` sockets on `addr`. The first resolves an ephemeral port, the
/// rest join it. The kernel spreads flows across them.
fn bind_udp_sockets(addr: SocketAddr, count: usize) -> Result<Vec<UdpSocket>, CallsError> {
    let bind_failed = |e: std::io::Error| {
        warn!(target: "calls.backend.embedded", error = %e, addr = %addr, "Failed to bind ICE UDP socket");
        CallsError::Backend(format!("Failed to bind ICE UDP socket {addr}: {e}"))
    };

    let count = if cfg!(unix) { count.max(1) } else { 1 };
    let first = bind_udp_socket(addr, count > 1).map_err(bind_failed)?;
    let bound = first
        .local_addr()
        .map_err(|e| CallsError::Backend(format!("ICE UDP socket has no address: {e}")))?;

    let mut sockets = Vec::with_capacity(count);
    sockets.push(first);
    for _ in 1..count {
        sockets.push(bind_udp_socket(bound, true).map_err(bind_failed)?);
    }
    Ok(sockets)
}

impl EmbeddedRtcServer {
    /// Bind sockets and start the engine tasks.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Backend` if a socket cannot be bound. This is fatal
    /// to activation.
    #[instrument(skip_all, name = "calls.backend.embedded.start")]
    pub async fn start(
        config: RtcServerConfig,
        cancel_token: CancellationToken,
    ) -> Result<Arc<Self>, CallsError> {
        let udp_bind = SocketAddr::new(
            bind_ip(config.ice_address_udp, config.enable_ipv6),
            config.ice_port_udp,
        );
        let udp_sockets = bind_udp_sockets(udp_bind, config.udp_sockets_count)?;
        let udp_addr = udp_sockets
            .first()
            .ok_or_else(|| CallsError::Internal("No ICE UDP socket bound".to_string()))?
            .local_addr()
            .map_err(|e| CallsError::Backend(format!("ICE UDP socket has no address: {e}")))?;

        let tcp_bind = SocketAddr::new(
            bind_ip(config.ice_address_tcp, config.enable_ipv6),
            config.ice_port_tcp,
        );
        let tcp = TcpListener::bind(tcp_bind).await.map_err(|e| {
            warn!(target: "calls.backend.embedded", error = %e, addr = %tcp_bind, "Failed to bind ICE TCP listener");
            CallsError::Backend(format!("Failed to bind ICE TCP listener {tcp_bind}: {e}"))
        })?;
        let tcp_addr = tcp
            .local_addr()
            .map_err(|e| CallsError::Backend(format!("ICE TCP listener has no address: {e}")))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let workers = udp_sockets.len();

        let server = Arc::new(Self {
            config,
            udp_addr,
            udp_sockets: workers,
            tcp_addr,
            sessions: RwLock::new(HashMap::new()),
            events_tx: RwLock::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            cancel_token,
            tasks: Mutex::new(Vec::new()),
            packets_received: Arc::new(AtomicU64::new(0)),
            tcp_connections: Arc::new(AtomicU64::new(0)),
        });

        let mut tasks = Vec::with_capacity(workers + 2);
        for (worker, socket) in udp_sockets.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_udp_worker(
                socket,
                worker,
                Arc::clone(&server.packets_received),
                server.cancel_token.child_token(),
            )));
        }
        tasks.push(tokio::spawn(run_tcp_acceptor(
            tcp,
            Arc::clone(&server.tcp_connections),
            server.cancel_token.child_token(),
        )));
        if server.config.turn.static_auth_secret.is_some() {
            tasks.push(tokio::spawn(run_turn_rotation(
                Arc::clone(&server),
                server.cancel_token.child_token(),
            )));
        }
        *server.tasks.lock().await = tasks;

        info!(
            target: "calls.backend.embedded",
            udp_addr = %udp_addr,
            tcp_addr = %tcp_addr,
            udp_workers = workers,
            server_side_turn = server.config.turn.static_auth_secret.is_some(),
            "Embedded media engine started"
        );
        Ok(server)
    }

    #[must_use]
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Number of bound ICE UDP sockets, one worker each.
    #[must_use]
    pub fn udp_socket_count(&self) -> usize {
        self.udp_sockets
    }

    #[must_use]
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tcp_connections(&self) -> u64 {
        self.tcp_connections.load(Ordering::Relaxed)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Host candidates advertised to clients. Empty when bound to an
    /// unspecified address without a host override.
    #[must_use]
    pub fn host_candidates(&self) -> Vec<String> {
        let host = match &self.config.ice_host_override {
            Some(h) => h.clone(),
            None if self.udp_addr.ip().is_unspecified() => return Vec::new(),
            None => self.udp_addr.ip().to_string(),
        };
        let udp_port = self
            .config
            .ice_host_port_override
            .unwrap_or(self.udp_addr.port());
        let tcp_port = self
            .config
            .ice_host_port_override
            .unwrap_or(self.tcp_addr.port());

        vec![
            format!("candidate:1 1 udp {UDP_HOST_PRIORITY} {host} {udp_port} typ host"),
            format!(
                "candidate:2 1 tcp {TCP_HOST_PRIORITY} {host} {tcp_port} typ host tcptype passive"
            ),
        ]
    }

    /// ICE servers for `session_id`, with generated TURN credentials filled
    /// in for TURN entries that carry none.
    #[must_use]
    pub fn ice_servers_for(&self, session_id: &SessionId) -> Vec<IceServerConfig> {
        let generated = self.config.turn.static_auth_secret.as_ref().map(|secret| {
            turn::generate(
                secret,
                session_id,
                self.config.turn.credentials_expiration,
                chrono::Utc::now().timestamp(),
            )
        });

        self.config
            .ice_servers
            .iter()
            .map(|server| match &generated {
                Some(creds) if server.is_turn() && server.credential.is_none() => IceServerConfig {
                    urls: server.urls.clone(),
                    username: Some(creds.username.clone()),
                    credential: Some(creds.credential.clone()),
                },
                _ => server.clone(),
            })
            .collect()
    }

    async fn emit(&self, message: SignalingMessage) -> Result<(), CallsError> {
        let tx = self
            .events_tx
            .read()
            .await
            .clone()
            .ok_or(CallsError::BackendTerminated)?;
        tx.send(message)
            .await
            .map_err(|_| CallsError::BackendTerminated)
    }

    async fn announce_ice_servers(&self, to: &SignalingMessage) -> Result<(), CallsError> {
        let payload = serde_json::to_string(&self.ice_servers_for(&to.session_id))
            .map_err(|e| CallsError::Internal(format!("Failed to encode ICE servers: {e}")))?;
        self.emit(to.reply(MessageKind::IceServers, payload)).await
    }

    async fn on_join(&self, message: &SignalingMessage) -> Result<(), CallsError> {
        self.sessions.write().await.insert(
            message.session_id.clone(),
            HostedSession {
                call_id: message.call_id.clone(),
                user_id: message.user_id.clone(),
                remote_sdp: None,
                remote_candidates: Vec::new(),
            },
        );

        self.announce_ice_servers(message).await?;
        for candidate in self.host_candidates() {
            let payload = serde_json::json!({
                "candidate": candidate,
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            });
            self.emit(message.reply(MessageKind::Ice, payload.to_string()))
                .await?;
        }

        debug!(
            target: "calls.backend.embedded",
            call_id = %message.call_id,
            session_id = %message.session_id,
            "Session joined embedded engine"
        );
        Ok(())
    }

    async fn on_leave(&self, message: &SignalingMessage) -> Result<(), CallsError> {
        if self
            .sessions
            .write()
            .await
            .remove(&message.session_id)
            .is_some()
        {
            self.emit(message.reply(MessageKind::Close, "")).await?;
        }
        Ok(())
    }

    /// Forward a media-state change to every other session of the call.
    async fn fan_out(&self, message: &SignalingMessage) -> Result<(), CallsError> {
        let peers: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(id, s)| s.call_id == message.call_id && **id != message.session_id)
            .map(|(id, _)| id.clone())
            .collect();

        for peer in peers {
            self.emit(SignalingMessage {
                call_id: message.call_id.clone(),
                session_id: peer,
                user_id: message.user_id.clone(),
                direction: Direction::BackendToClient,
                kind: message.kind,
                payload: message.session_id.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn rotate_turn_credentials(&self) {
        let targets: Vec<SignalingMessage> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| {
                SignalingMessage::from_client(
                    s.call_id.clone(),
                    id.clone(),
                    s.user_id.clone(),
                    MessageKind::IceServers,
                    "",
                )
            })
            .collect();

        for target in &targets {
            if let Err(e) = self.announce_ice_servers(target).await {
                warn!(target: "calls.backend.embedded", error = %e, "Failed to announce rotated TURN credentials");
                return;
            }
        }
        metrics::record_turn_rotation();
        debug!(
            target: "calls.backend.embedded",
            sessions = targets.len(),
            "TURN credentials rotated"
        );
    }
}

#[async_trait]
impl MediaBackend for EmbeddedRtcServer {
    fn kind(&self) -> &'static str {
        "embedded"
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallsError> {
        if self.cancel_token.is_cancelled() {
            return Err(CallsError::BackendTerminated);
        }

        match message.kind {
            MessageKind::Join | MessageKind::Reconnect => return self.on_join(&message).await,
            MessageKind::Leave => return self.on_leave(&message).await,
            _ => {}
        }

        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&message.session_id) else {
                return Err(CallsError::Internal(format!(
                    "Session {} has not joined",
                    message.session_id
                )));
            };
            match message.kind {
                MessageKind::Sdp => session.remote_sdp = Some(message.payload.clone()),
                MessageKind::Ice => session.remote_candidates.push(message.payload.clone()),
                _ => {}
            }
        }

        match message.kind {
            MessageKind::Mute
            | MessageKind::Unmute
            | MessageKind::ScreenOn
            | MessageKind::ScreenOff
            | MessageKind::VoiceOn
            | MessageKind::VoiceOff => self.fan_out(&message).await,
            _ => Ok(()),
        }
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<SignalingMessage>> {
        self.events_rx.lock().await.take()
    }

    async fn stop(&self) {
        self.cancel_token.cancel();
        // Dropping the sender closes the event stream once buffered events drain
        self.events_tx.write().await.take();
        self.sessions.write().await.clear();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(target: "calls.backend.embedded", "Engine task did not stop in time");
            }
        }
        info!(target: "calls.backend.embedded", "Embedded media engine stopped");
    }
}

async fn run_udp_worker(
    socket: UdpSocket,
    worker: usize,
    packets: Arc<AtomicU64>,
    cancel_token: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => {
                    packets.fetch_add(1, Ordering::Relaxed);
                    trace!(target: "calls.backend.embedded", worker = worker, len = len, peer = %peer, "ICE datagram");
                }
                Err(e) => {
                    warn!(target: "calls.backend.embedded", worker = worker, error = %e, "ICE UDP receive failed");
                }
            }
        }
    }
}

async fn run_tcp_acceptor(
    listener: TcpListener,
    connections: Arc<AtomicU64>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            result = listener.accept() => match result {
                Ok((_stream, peer)) => {
                    connections.fetch_add(1, Ordering::Relaxed);
                    trace!(target: "calls.backend.embedded", peer = %peer, "ICE TCP connection");
                }
                Err(e) => {
                    warn!(target: "calls.backend.embedded", error = %e, "ICE TCP accept failed");
                }
            }
        }
    }
}

async fn run_turn_rotation(server: Arc<EmbeddedRtcServer>, cancel_token: CancellationToken) {
    let period = server
        .config
        .turn
        .credentials_expiration
        .max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => server.rotate_turn_credentials().await,
        }
    }
}
