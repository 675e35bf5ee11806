//! Loopback media daemon.
//!
//! Accepts WebSocket connections on an ephemeral port, records every signal
//! frame and the client id header, answers pings, and replies to a join with
//! an SDP offer for the same session.

use calls_service::backend::rtcd::{DaemonFrame, CLIENT_ID_HEADER};
use calls_service::signaling::{MessageKind, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Payload of the offer sent in reply to a join.
pub const DAEMON_OFFER: &str = "daemon-offer";

#[derive(Default)]
struct DaemonState {
    received: Vec<SignalingMessage>,
    client_ids: Vec<String>,
    authorizations: Vec<Option<String>>,
}

pub struct MockDaemon {
    addr: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
    push_tx: broadcast::Sender<SignalingMessage>,
    drop_token: Mutex<CancellationToken>,
    cancel_token: CancellationToken,
}

impl MockDaemon {
    /// Bind and start accepting.
    ///
    /// # Panics
    ///
    /// Panics if the loopback listener cannot be bound.
    pub async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, _) = broadcast::channel(64);

        let daemon = Arc::new(Self {
            addr,
            state: Arc::new(Mutex::new(DaemonState::default())),
            push_tx,
            drop_token: Mutex::new(CancellationToken::new()),
            cancel_token: CancellationToken::new(),
        });

        let accept = Arc::clone(&daemon);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept.cancel_token.cancelled() => break,
                    conn = listener.accept() => {
                        let Ok((stream, _)) = conn else { continue };
                        let daemon = Arc::clone(&accept);
                        tokio::spawn(async move { daemon.serve(stream).await });
                    }
                }
            }
        });

        daemon
    }

    async fn serve(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let state = Arc::clone(&self.state);
        let callback = move |req: &Request, resp: Response| {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let mut state = state.lock().unwrap();
            state
                .client_ids
                .push(header(CLIENT_ID_HEADER).unwrap_or_default());
            state.authorizations.push(header("authorization"));
            Ok(resp)
        };
        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };
        let (mut sink, mut stream) = ws.split();
        let mut pushes = self.push_tx.subscribe();
        let dropped = self.drop_token.lock().unwrap().clone();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = dropped.cancelled() => break,
                pushed = pushes.recv() => {
                    let Ok(message) = pushed else { continue };
                    let text = serde_json::to_string(&DaemonFrame::Signal(message)).unwrap();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    let Some(Ok(Message::Text(text))) = frame else { break };
                    let reply = match serde_json::from_str::<DaemonFrame>(&text) {
                        Ok(DaemonFrame::Signal(message)) => {
                            let reply = message
                                .kind
                                .is_join()
                                .then(|| DaemonFrame::Signal(message.reply(MessageKind::Sdp, DAEMON_OFFER)));
                            self.state.lock().unwrap().received.push(message);
                            reply
                        }
                        Ok(DaemonFrame::Ping) => Some(DaemonFrame::Pong),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let text = serde_json::to_string(&reply).unwrap();
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        let _ = sink.close().await;
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Signal frames received so far, across connections.
    pub fn received(&self) -> Vec<SignalingMessage> {
        self.state.lock().unwrap().received.clone()
    }

    /// Client id header of every accepted connection.
    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().client_ids.clone()
    }

    /// Authorization header of every accepted connection.
    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().authorizations.clone()
    }

    /// Send a frame to every connected client.
    pub fn push(&self, message: SignalingMessage) {
        let _ = self.push_tx.send(message);
    }

    /// Close every open connection; new connections are still accepted.
    pub fn drop_connections(&self) {
        let mut token = self.drop_token.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
