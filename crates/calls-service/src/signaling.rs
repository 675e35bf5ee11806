//! Signaling message model.
//!
//! A [`SignalingMessage`] is one negotiation or media-control frame travelling
//! between a client session and the media backend. Payloads are opaque to the
//! relay; only the routing header is interpreted.

use common::types::{CallId, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    /// Bounded label value for metrics.
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "inbound",
            Direction::BackendToClient => "outbound",
        }
    }
}

/// Message kind. Everything other than session lifecycle is forwarded as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Session joins a call.
    Join,
    /// Session rejoins after a transport reconnect.
    Reconnect,
    /// Session leaves a call.
    Leave,
    /// SDP offer or answer.
    Sdp,
    /// Trickled ICE candidate.
    Ice,
    /// ICE server list (with TURN credentials) announced to a client.
    IceServers,
    Mute,
    Unmute,
    ScreenOn,
    ScreenOff,
    VoiceOn,
    VoiceOff,
    /// Backend closed the session.
    Close,
}

impl MessageKind {
    /// Whether the message starts hosting a session on a call.
    #[must_use]
    pub fn is_join(self) -> bool {
        matches!(self, MessageKind::Join | MessageKind::Reconnect)
    }

    /// Whether the message ends a session on a call.
    #[must_use]
    pub fn is_leave(self) -> bool {
        matches!(self, MessageKind::Leave | MessageKind::Close)
    }
}

/// One signaling frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub call_id: CallId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub direction: Direction,
    pub kind: MessageKind,
    /// Opaque payload (SDP, candidate JSON, ...).
    #[serde(default)]
    pub payload: String,
}

impl SignalingMessage {
    /// Build a client-originated frame.
    #[must_use]
    pub fn from_client(
        call_id: CallId,
        session_id: SessionId,
        user_id: UserId,
        kind: MessageKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            session_id,
            user_id,
            direction: Direction::ClientToBackend,
            kind,
            payload: payload.into(),
        }
    }

    /// Build a backend-originated frame addressed to the same session.
    #[must_use]
    pub fn reply(&self, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            call_id: self.call_id.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            direction: Direction::BackendToClient,
            kind,
            payload: payload.into(),
        }
    }
}
