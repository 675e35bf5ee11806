//! Client signaling WebSocket endpoint.
//!
//! `GET /ws?session_id=…&user_id=…` upgrades and registers the connection with
//! the [`TransportHub`]. Authentication is done by the host proxy in front of
//! this endpoint.
//!
//! Client frames are JSON [`ClientFrame`]s; the session and user come from the
//! connection, never from the frame. Outbound frames are full
//! [`SignalingMessage`]s. A dropped connection that had joined a call sends a
//! synthetic leave and retires its relay queue. A connection replaced by a
//! newer one for the same session does neither; the session lives on.

use crate::errors::CallsError;
use crate::relay::SignalingRelay;
use crate::signaling::{MessageKind, SignalingMessage};
use crate::transport::{ClientConnection, TransportHub};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::{CallId, SessionId, UserId};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientFrame {
    pub call_id: CallId,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<TransportHub>,
    pub relay: Arc<SignalingRelay>,
}

pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: WsState) {
    let session_id = SessionId::from(params.session_id);
    let user_id = UserId::from(params.user_id);
    let ClientConnection {
        connection_id,
        mut outbound,
    } = state.hub.register(session_id.clone()).await;
    let (mut sink, mut stream) = socket.split();
    let mut joined: Option<CallId> = None;

    info!(target: "calls.ws", session_id = %session_id, "Client connected");

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    // Replaced by a newer connection for the same session
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "calls.ws", error = %e, "Failed to encode outbound frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let frame = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(target: "calls.ws", session_id = %session_id, error = %e, "Dropping malformed client frame");
                            continue;
                        }
                    };
                    if frame.kind.is_join() {
                        joined = Some(frame.call_id.clone());
                    } else if frame.kind == MessageKind::Leave {
                        joined = None;
                    }

                    let message = SignalingMessage::from_client(
                        frame.call_id,
                        session_id.clone(),
                        user_id.clone(),
                        frame.kind,
                        frame.payload,
                    );
                    match state.relay.handle_client_frame(message).await {
                        Ok(()) => {}
                        Err(CallsError::BackendTerminated) => {
                            warn!(target: "calls.ws", session_id = %session_id, "Media backend gone, closing client");
                            break;
                        }
                        Err(e) => {
                            warn!(target: "calls.ws", session_id = %session_id, error = %e, "Client frame rejected");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "calls.ws", session_id = %session_id, error = %e, "Client connection error");
                    break;
                }
            }
        }
    }

    if !state.hub.unregister(&session_id, connection_id).await {
        info!(
            target: "calls.ws",
            session_id = %session_id,
            connection_id = connection_id,
            "Client connection replaced"
        );
        return;
    }

    if let Some(call_id) = joined {
        let leave =
            SignalingMessage::from_client(call_id, session_id.clone(), user_id, MessageKind::Leave, "");
        if let Err(e) = state.relay.handle_client_frame(leave).await {
            debug!(target: "calls.ws", session_id = %session_id, error = %e, "Leave on disconnect failed");
        }
    }
    state.relay.end_session(&session_id).await;
    info!(target: "calls.ws", session_id = %session_id, "Client disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parses_without_payload() {
        let frame: ClientFrame = serde_json::from_str(r#"{"call_id":"c1","kind":"join"}"#).unwrap();
        assert_eq!(frame.call_id, CallId::from("c1"));
        assert_eq!(frame.kind, MessageKind::Join);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_client_frame_ignores_routing_fields() {
        // Session and user always come from the connection
        let frame: ClientFrame = serde_json::from_str(
            r#"{"call_id":"c1","kind":"sdp","payload":"v=0","session_id":"spoofed"}"#,
        )
        .unwrap();
        assert_eq!(frame.payload, "v=0");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"call_id":"c1","kind":"explode"}"#).is_err());
    }
}
