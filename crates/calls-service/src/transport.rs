//! Client transport registry.
//!
//! The relay never touches sockets. It writes through [`ClientTransport`],
//! keyed by session id. [`TransportHub`] is the in-process implementation: each
//! connected client registers a bounded channel that its connection task
//! drains onto the wire. Registrations carry a connection id so a replaced
//! connection cannot unregister its successor.

use crate::errors::CallsError;
use crate::signaling::SignalingMessage;
use async_trait::async_trait;
use common::types::SessionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Per-client duplex channel, outbound half.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Write one frame to the session's connection.
    async fn send(&self, session_id: &SessionId, message: SignalingMessage)
        -> Result<(), CallsError>;

    /// Whether the session's connection terminates on this node.
    async fn is_local(&self, session_id: &SessionId) -> bool;
}

/// One registered client connection.
pub struct ClientConnection {
    pub connection_id: u64,
    pub outbound: mpsc::Receiver<SignalingMessage>,
}

struct Registered {
    connection_id: u64,
    sender: mpsc::Sender<SignalingMessage>,
}

/// Registry of connected sessions on this node.
pub struct TransportHub {
    buffer: usize,
    next_connection_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Registered>>,
}

impl TransportHub {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_connection_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. A second registration for the same session
    /// replaces the first, whose receiver then closes.
    pub async fn register(&self, session_id: SessionId) -> ClientConnection {
        let (sender, outbound) = mpsc::channel(self.buffer);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self.sessions.write().await.insert(
            session_id.clone(),
            Registered {
                connection_id,
                sender,
            },
        );
        if let Some(previous) = replaced {
            debug!(
                target: "calls.transport",
                session_id = %session_id,
                previous = previous.connection_id,
                connection_id = connection_id,
                "Replaced existing client connection"
            );
        }
        ClientConnection {
            connection_id,
            outbound,
        }
    }

    /// Remove the session if `connection_id` is still its registered
    /// connection. Returns `false` when a newer connection replaced it.
    pub async fn unregister(&self, session_id: &SessionId, connection_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(current) if current.connection_id == connection_id => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl ClientTransport for TransportHub {
    async fn send(
        &self,
        session_id: &SessionId,
        message: SignalingMessage,
    ) -> Result<(), CallsError> {
        let tx = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|registered| registered.sender.clone())
            .ok_or_else(|| CallsError::Transport(format!("Session {session_id} not connected")))?;

        tx.send(message)
            .await
            .map_err(|_| CallsError::Transport(format!("Session {session_id} connection closed")))
    }

    async fn is_local(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::MessageKind;
    use common::types::{CallId, UserId};

    fn frame(session: &str) -> SignalingMessage {
        SignalingMessage::from_client(
            CallId::from("call-1"),
            SessionId::from(session),
            UserId::from("user-1"),
            MessageKind::Sdp,
            "v=0",
        )
        .reply(MessageKind::Sdp, "v=0")
    }

    #[tokio::test]
    async fn test_registered_session_receives_frames() {
        let hub = TransportHub::new(8);
        let session = SessionId::from("sess-1");
        let mut conn = hub.register(session.clone()).await;

        assert!(hub.is_local(&session).await);
        hub.send(&session, frame("sess-1")).await.unwrap();
        assert_eq!(conn.outbound.recv().await.unwrap().payload, "v=0");
    }

    #[tokio::test]
    async fn test_unknown_session_is_transport_error() {
        let hub = TransportHub::new(8);
        let session = SessionId::from("ghost");

        assert!(!hub.is_local(&session).await);
        assert!(matches!(
            hub.send(&session, frame("ghost")).await,
            Err(CallsError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_transport_error() {
        let hub = TransportHub::new(8);
        let session = SessionId::from("sess-1");
        drop(hub.register(session.clone()).await);

        assert!(matches!(
            hub.send(&session, frame("sess-1")).await,
            Err(CallsError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_reregister_replaces_connection() {
        let hub = TransportHub::new(8);
        let session = SessionId::from("sess-1");
        let mut first = hub.register(session.clone()).await;
        let mut second = hub.register(session.clone()).await;
        assert_ne!(first.connection_id, second.connection_id);

        assert!(first.outbound.recv().await.is_none());
        hub.send(&session, frame("sess-1")).await.unwrap();
        assert!(second.outbound.recv().await.is_some());
        assert_eq!(hub.len().await, 1);

        hub.unregister(&session, second.connection_id).await;
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let hub = TransportHub::new(8);
        let session = SessionId::from("sess-1");
        let first = hub.register(session.clone()).await;
        let mut second = hub.register(session.clone()).await;

        assert!(!hub.unregister(&session, first.connection_id).await);
        assert!(hub.is_local(&session).await);
        hub.send(&session, frame("sess-1")).await.unwrap();
        assert!(second.outbound.recv().await.is_some());

        assert!(hub.unregister(&session, second.connection_id).await);
        assert!(!hub.is_local(&session).await);
    }
}
