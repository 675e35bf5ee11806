//! Client transport that records writes.
//!
//! Sessions are local only after [`RecordingTransport::connect`]. Writes whose
//! payload is registered with [`RecordingTransport::fail_payload`] return a
//! transport error, and an optional per-write delay simulates a slow client.

use async_trait::async_trait;
use calls_service::errors::CallsError;
use calls_service::signaling::SignalingMessage;
use calls_service::transport::ClientTransport;
use common::types::SessionId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct RecordingTransport {
    local: Mutex<HashSet<SessionId>>,
    delivered: Mutex<HashMap<SessionId, Vec<SignalingMessage>>>,
    failing_payloads: Mutex<HashSet<String>>,
    slow_sessions: Mutex<HashMap<SessionId, Duration>>,
    written: Notify,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, session_id: &str) {
        self.local.lock().unwrap().insert(SessionId::from(session_id));
    }

    pub fn disconnect(&self, session_id: &str) {
        self.local.lock().unwrap().remove(&SessionId::from(session_id));
    }

    /// Writes carrying exactly this payload fail.
    pub fn fail_payload(&self, payload: &str) {
        self.failing_payloads
            .lock()
            .unwrap()
            .insert(payload.to_string());
    }

    /// Every write to `session_id` takes `delay`.
    pub fn slow_session(&self, session_id: &str, delay: Duration) {
        self.slow_sessions
            .lock()
            .unwrap()
            .insert(SessionId::from(session_id), delay);
    }

    /// Frames successfully written to `session_id`, in order.
    pub fn delivered(&self, session_id: &str) -> Vec<SignalingMessage> {
        self.delivered
            .lock()
            .unwrap()
            .get(&SessionId::from(session_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Payloads successfully written to `session_id`, in order.
    pub fn payloads(&self, session_id: &str) -> Vec<String> {
        self.delivered(session_id)
            .into_iter()
            .map(|m| m.payload)
            .collect()
    }

    /// Wait until `session_id` has at least `count` successful writes.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within `timeout`.
    pub async fn wait_for(&self, session_id: &str, count: usize, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.written.notified();
                if self.delivered(session_id).len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "session {session_id} got {} writes, wanted {count}",
                self.delivered(session_id).len()
            )
        });
    }
}

#[async_trait]
impl ClientTransport for RecordingTransport {
    async fn send(
        &self,
        session_id: &SessionId,
        message: SignalingMessage,
    ) -> Result<(), CallsError> {
        let delay = self.slow_sessions.lock().unwrap().get(session_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failing_payloads
            .lock()
            .unwrap()
            .contains(&message.payload)
        {
            return Err(CallsError::Transport("mock write failure".to_string()));
        }

        self.delivered
            .lock()
            .unwrap()
            .entry(session_id.clone())
            .or_default()
            .push(message);
        self.written.notify_waiters();
        Ok(())
    }

    async fn is_local(&self, session_id: &SessionId) -> bool {
        self.local.lock().unwrap().contains(session_id)
    }
}
