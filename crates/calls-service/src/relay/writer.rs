//! Per-session outbound writer.
//!
//! Each local session gets a bounded FIFO and one task that drains it onto the
//! client transport. A failed or timed-out write drops that message only; the
//! writer moves on to the next one. Dropping the writer closes the queue and
//! the task exits once the queue is empty.

use crate::observability::metrics;
use crate::signaling::SignalingMessage;
use crate::transport::ClientTransport;
use common::types::SessionId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

pub(crate) struct SessionWriter {
    sender: mpsc::Sender<SignalingMessage>,
    task: JoinHandle<()>,
}

impl SessionWriter {
    pub(crate) fn spawn(
        session_id: SessionId,
        transport: Arc<dyn ClientTransport>,
        capacity: usize,
        write_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(session_id, receiver, transport, write_timeout));
        Self { sender, task }
    }

    /// Enqueue without waiting. A full queue means the client is not keeping up.
    pub(crate) fn try_enqueue(
        &self,
        message: SignalingMessage,
    ) -> Result<(), TrySendError<SignalingMessage>> {
        self.sender.try_send(message)
    }

    /// Close the queue and return the task so the caller can await the drain.
    pub(crate) fn close(self) -> JoinHandle<()> {
        drop(self.sender);
        self.task
    }
}

#[instrument(skip_all, name = "calls.relay.writer", fields(session_id = %session_id))]
async fn run(
    session_id: SessionId,
    mut receiver: mpsc::Receiver<SignalingMessage>,
    transport: Arc<dyn ClientTransport>,
    write_timeout: Duration,
) {
    while let Some(message) = receiver.recv().await {
        let kind = message.kind;
        let started = Instant::now();
        match tokio::time::timeout(write_timeout, transport.send(&session_id, message)).await {
            Ok(Ok(())) => metrics::record_relay_write_latency(started.elapsed()),
            Ok(Err(e)) => {
                metrics::record_relay_drop("write_failed");
                warn!(
                    target: "calls.relay",
                    session_id = %session_id,
                    kind = ?kind,
                    error = %e,
                    "Client write failed, message dropped"
                );
            }
            Err(_) => {
                metrics::record_relay_drop("write_timeout");
                warn!(
                    target: "calls.relay",
                    session_id = %session_id,
                    kind = ?kind,
                    timeout_ms = u64::try_from(write_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Client write timed out, message dropped"
                );
            }
        }
    }
    debug!(target: "calls.relay", session_id = %session_id, "Session writer drained");
}
