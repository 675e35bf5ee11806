//! Signaling relay.
//!
//! Two paths run concurrently:
//!
//! - **Inbound**: client frames arrive through [`SignalingRelay::handle_client_frame`].
//!   With the embedded engine the frame goes to the node that owns the call:
//!   this node's engine if it owns (or just claimed) the call, otherwise a
//!   `ForwardToHost` broadcast to the owner. With the external daemon every
//!   frame goes to the daemon.
//! - **Outbound**: one dispatcher task reads the backend event stream in order
//!   and appends each message to the target session's bounded queue, drained
//!   by a per-session writer. Messages for sessions connected to a peer node
//!   are broadcast as `DeliverToClient`.
//!
//! Per-session order is preserved because a single dispatcher feeds each FIFO.
//! A slow or broken client only loses its own messages.

mod writer;

use crate::backend::MediaBackend;
use crate::cluster::store::{ClusterEventKind, CoordinationStore};
use crate::errors::CallsError;
use crate::observability::{metrics, HealthState};
use crate::ownership::{CallOwner, NodeOwnershipTracker};
use crate::signaling::{Direction, MessageKind, SignalingMessage};
use crate::transport::ClientTransport;
use common::types::{CallId, NodeId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use writer::SessionWriter;

/// Bound on draining the relay during shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Per-session outbound queue capacity.
    pub queue_capacity: usize,
    /// Bound on a single client write.
    pub write_timeout: Duration,
}

/// Everything the relay talks to.
pub struct RelayDeps {
    pub backend: Arc<dyn MediaBackend>,
    pub tracker: Arc<NodeOwnershipTracker>,
    pub store: Arc<dyn CoordinationStore>,
    pub transport: Arc<dyn ClientTransport>,
    pub health: Arc<HealthState>,
}

pub struct SignalingRelay {
    backend: Arc<dyn MediaBackend>,
    tracker: Arc<NodeOwnershipTracker>,
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn ClientTransport>,
    health: Arc<HealthState>,
    config: RelayConfig,
    writers: Mutex<HashMap<SessionId, SessionWriter>>,
    /// Sessions hosted here, per call. Used to release a call on last leave.
    hosted: Mutex<HashMap<CallId, HashSet<SessionId>>>,
    terminated: AtomicBool,
    cancel_token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(deps: RelayDeps, config: RelayConfig, cancel_token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            backend: deps.backend,
            tracker: deps.tracker,
            store: deps.store,
            transport: deps.transport,
            health: deps.health,
            config,
            writers: Mutex::new(HashMap::new()),
            hosted: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            cancel_token,
            dispatcher: Mutex::new(None),
        })
    }

    fn node_id(&self) -> &NodeId {
        self.tracker.node_id()
    }

    /// Start the outbound dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::Internal` if the backend event stream was already
    /// taken.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallsError> {
        let events = self.backend.take_events().await.ok_or_else(|| {
            CallsError::Internal("Backend event stream already taken".to_string())
        })?;

        let relay = Arc::clone(self);
        let task = tokio::spawn(async move { relay.run_dispatcher(events).await });
        *self.dispatcher.lock().await = Some(task);

        info!(
            target: "calls.relay",
            backend = self.backend.kind(),
            "Signaling relay started"
        );
        Ok(())
    }

    /// Whether the backend event stream has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Route a frame read from a client connection on this node.
    ///
    /// # Errors
    ///
    /// - `CallsError::BackendTerminated` once the backend is gone
    /// - `CallsError::CoordinationUnavailable` if a claim or forward cannot
    ///   reach the store
    /// - any error the backend returns for the frame
    #[instrument(skip_all, name = "calls.relay.inbound", fields(call_id = %message.call_id, session_id = %message.session_id))]
    pub async fn handle_client_frame(&self, message: SignalingMessage) -> Result<(), CallsError> {
        self.route_inbound(message, true).await
    }

    /// Inject a frame forwarded by a peer. Never forwards again.
    ///
    /// # Errors
    ///
    /// See [`SignalingRelay::handle_client_frame`].
    pub async fn inject_forwarded(&self, message: SignalingMessage) -> Result<(), CallsError> {
        self.route_inbound(message, false).await
    }

    /// Deliver a backend frame published by a peer, if the session is
    /// connected here.
    pub async fn deliver_to_client(&self, message: SignalingMessage) {
        // Sessions connected to other nodes are theirs to deliver
        self.enqueue_if_local(message).await;
    }

    /// Retire the outbound queue of a session whose connection is gone. The
    /// writer finishes what is already queued and exits.
    pub async fn end_session(&self, session_id: &SessionId) {
        let mut writers = self.writers.lock().await;
        if let Some(writer) = writers.remove(session_id) {
            drop(writer.close());
            debug!(target: "calls.relay", session_id = %session_id, "Session writer retired");
        }
        metrics::set_relay_sessions_active(writers.len());
    }

    async fn route_inbound(
        &self,
        message: SignalingMessage,
        may_forward: bool,
    ) -> Result<(), CallsError> {
        if self.is_terminated() {
            return Err(CallsError::BackendTerminated);
        }
        if message.direction != Direction::ClientToBackend {
            return Err(CallsError::Internal(
                "Outbound frame on the inbound path".to_string(),
            ));
        }

        match self.tracker.owner_of(&message.call_id).await {
            CallOwner::Daemon => {
                self.backend.send(message).await?;
                metrics::record_relay_message("inbound", "daemon");
                Ok(())
            }
            CallOwner::Node(owner) if owner == *self.node_id() => self.host_locally(message).await,
            CallOwner::Node(owner) => self.forward(owner, message, may_forward).await,
            CallOwner::Unknown if message.kind.is_leave() => {
                debug!(
                    target: "calls.relay",
                    call_id = %message.call_id,
                    "Leave for a call with no known host, ignoring"
                );
                Ok(())
            }
            CallOwner::Unknown => match self.tracker.claim(&message.call_id).await {
                Ok(()) => self.host_locally(message).await,
                // The store is authoritative; route to the node it names
                Err(CallsError::OwnershipConflict { owner, .. }) => {
                    self.forward(owner, message, may_forward).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn host_locally(&self, message: SignalingMessage) -> Result<(), CallsError> {
        let call_id = message.call_id.clone();
        let session_id = message.session_id.clone();
        let kind = message.kind;

        self.backend.send(message).await?;
        metrics::record_relay_message("inbound", "local");

        if kind.is_join() {
            self.hosted
                .lock()
                .await
                .entry(call_id)
                .or_default()
                .insert(session_id);
        } else if kind == MessageKind::Leave {
            let call_ended = {
                let mut hosted = self.hosted.lock().await;
                match hosted.get_mut(&call_id) {
                    Some(sessions) => {
                        sessions.remove(&session_id);
                        if sessions.is_empty() {
                            hosted.remove(&call_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                }
            };
            if call_ended {
                if let Err(e) = self.tracker.release(&call_id).await {
                    warn!(
                        target: "calls.relay",
                        call_id = %call_id,
                        error = %e,
                        "Failed to release ownership of ended call"
                    );
                }
            }
        }
        Ok(())
    }

    async fn forward(
        &self,
        owner: NodeId,
        message: SignalingMessage,
        may_forward: bool,
    ) -> Result<(), CallsError> {
        if !may_forward {
            metrics::record_relay_drop("misrouted");
            warn!(
                target: "calls.relay",
                call_id = %message.call_id,
                owner = %owner,
                "Forwarded frame arrived at a node that does not host the call"
            );
            return Ok(());
        }

        self.store
            .publish(
                self.node_id(),
                ClusterEventKind::ForwardToHost {
                    target: owner,
                    message,
                },
            )
            .await?;
        metrics::record_relay_message("inbound", "peer");
        Ok(())
    }

    #[instrument(skip_all, name = "calls.relay.dispatcher")]
    async fn run_dispatcher(self: Arc<Self>, mut events: mpsc::Receiver<SignalingMessage>) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    // Forward what the backend already produced, then stop
                    while let Ok(message) = events.try_recv() {
                        self.route_outbound(message).await;
                    }
                    debug!(target: "calls.relay", "Dispatcher stopped");
                    break;
                }
                event = events.recv() => match event {
                    Some(message) => self.route_outbound(message).await,
                    None => {
                        self.terminated.store(true, Ordering::Release);
                        self.health.set_not_ready();
                        error!(
                            target: "calls.relay",
                            backend = self.backend.kind(),
                            "Media backend terminated, relay stopping"
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn route_outbound(&self, message: SignalingMessage) {
        let Some(message) = self.enqueue_if_local(message).await else {
            return;
        };

        let session_id = message.session_id.clone();
        match self
            .store
            .publish(self.node_id(), ClusterEventKind::DeliverToClient { message })
            .await
        {
            Ok(_) => metrics::record_relay_message("outbound", "peer"),
            Err(e) => {
                metrics::record_relay_drop("publish_failed");
                warn!(
                    target: "calls.relay",
                    session_id = %session_id,
                    error = %e,
                    "Failed to hand off message for remote session"
                );
            }
        }
    }

    /// Queue the message for a session connected to this node, or hand it
    /// back. The connection check runs under the writers lock so a writer is
    /// never created after [`SignalingRelay::end_session`] retired it.
    async fn enqueue_if_local(&self, message: SignalingMessage) -> Option<SignalingMessage> {
        let mut writers = self.writers.lock().await;
        if !self.transport.is_local(&message.session_id).await {
            return Some(message);
        }
        self.enqueue(&mut writers, message);
        None
    }

    fn enqueue(&self, writers: &mut HashMap<SessionId, SessionWriter>, message: SignalingMessage) {
        let session_id = message.session_id.clone();
        let closes = message.kind == MessageKind::Close;

        let writer = writers.entry(session_id.clone()).or_insert_with(|| {
            SessionWriter::spawn(
                session_id.clone(),
                Arc::clone(&self.transport),
                self.config.queue_capacity,
                self.config.write_timeout,
            )
        });

        match writer.try_enqueue(message) {
            Ok(()) => metrics::record_relay_message("outbound", "local"),
            Err(TrySendError::Full(_)) => {
                metrics::record_relay_drop("queue_full");
                warn!(
                    target: "calls.relay",
                    session_id = %session_id,
                    "Session queue full, message dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                metrics::record_relay_drop("writer_closed");
                writers.remove(&session_id);
            }
        }

        if closes {
            // Queue closes behind the Close frame; the writer drains and exits
            writers.remove(&session_id);
        }
        metrics::set_relay_sessions_active(writers.len());
    }

    /// Number of sessions with an active writer.
    pub async fn active_sessions(&self) -> usize {
        self.writers.lock().await.len()
    }

    /// Calls with at least one session hosted on this node.
    pub async fn hosted_calls(&self) -> Vec<CallId> {
        let mut calls: Vec<_> = self.hosted.lock().await.keys().cloned().collect();
        calls.sort();
        calls
    }

    /// Stop the dispatcher and drain every session queue. Bounded by
    /// [`SHUTDOWN_DRAIN_TIMEOUT`].
    #[instrument(skip_all, name = "calls.relay.shutdown")]
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        if let Some(task) = self.dispatcher.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task)
                .await
                .is_err()
            {
                warn!(target: "calls.relay", "Dispatcher did not stop in time");
            }
        }

        let drains: Vec<JoinHandle<()>> = self
            .writers
            .lock()
            .await
            .drain()
            .map(|(_, writer)| writer.close())
            .collect();
        let pending = drains.len();
        if tokio::time::timeout(
            SHUTDOWN_DRAIN_TIMEOUT,
            futures_util::future::join_all(drains),
        )
        .await
        .is_err()
        {
            warn!(target: "calls.relay", sessions = pending, "Session writers did not drain in time");
        }
        metrics::set_relay_sessions_active(0);
        info!(target: "calls.relay", sessions = pending, "Signaling relay stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCoordinationStore;
    use crate::ownership::OwnershipMode;
    use async_trait::async_trait;
    use common::types::UserId;
    use std::sync::Mutex as StdMutex;

    /// Backend that records inbound frames and exposes an event sender.
    struct ScriptedBackend {
        received: StdMutex<Vec<SignalingMessage>>,
        events_tx: StdMutex<Option<mpsc::Sender<SignalingMessage>>>,
        events_rx: Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    }

    impl ScriptedBackend {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(64);
            Arc::new(Self {
                received: StdMutex::new(Vec::new()),
                events_tx: StdMutex::new(Some(tx)),
                events_rx: Mutex::new(Some(rx)),
            })
        }

        fn sender(&self) -> mpsc::Sender<SignalingMessage> {
            self.events_tx.lock().unwrap().clone().unwrap()
        }

        fn terminate(&self) {
            self.events_tx.lock().unwrap().take();
        }

        fn received(&self) -> Vec<SignalingMessage> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaBackend for ScriptedBackend {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, message: SignalingMessage) -> Result<(), CallsError> {
            self.received.lock().unwrap().push(message);
            Ok(())
        }

        async fn take_events(&self) -> Option<mpsc::Receiver<SignalingMessage>> {
            self.events_rx.lock().await.take()
        }

        async fn stop(&self) {
            self.terminate();
        }
    }

    /// Transport that records writes and fails payloads named "fail".
    #[derive(Default)]
    struct RecordingTransport {
        local: StdMutex<HashSet<SessionId>>,
        delivered: StdMutex<Vec<(SessionId, String)>>,
    }

    impl RecordingTransport {
        fn connect(&self, session: &str) {
            self.local.lock().unwrap().insert(SessionId::from(session));
        }

        fn delivered_to(&self, session: &str) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s.as_str() == session)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ClientTransport for RecordingTransport {
        async fn send(
            &self,
            session_id: &SessionId,
            message: SignalingMessage,
        ) -> Result<(), CallsError> {
            if message.payload == "fail" {
                return Err(CallsError::Transport("broken pipe".to_string()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((session_id.clone(), message.payload));
            Ok(())
        }

        async fn is_local(&self, session_id: &SessionId) -> bool {
            self.local.lock().unwrap().contains(session_id)
        }
    }

    struct Harness {
        relay: Arc<SignalingRelay>,
        backend: Arc<ScriptedBackend>,
        transport: Arc<RecordingTransport>,
        tracker: Arc<NodeOwnershipTracker>,
        store: Arc<MemoryCoordinationStore>,
        health: Arc<HealthState>,
    }

    async fn harness(mode: OwnershipMode) -> Harness {
        let store = Arc::new(MemoryCoordinationStore::new());
        let backend = ScriptedBackend::new();
        let transport = Arc::new(RecordingTransport::default());
        let tracker = Arc::new(NodeOwnershipTracker::new(
            NodeId::from("node-a"),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            mode,
        ));
        let health = Arc::new(HealthState::new());
        health.set_ready();

        let relay = SignalingRelay::new(
            RelayDeps {
                backend: Arc::clone(&backend) as Arc<dyn MediaBackend>,
                tracker: Arc::clone(&tracker),
                store: Arc::clone(&store) as Arc<dyn CoordinationStore>,
                transport: Arc::clone(&transport) as Arc<dyn ClientTransport>,
                health: Arc::clone(&health),
            },
            RelayConfig {
                queue_capacity: 16,
                write_timeout: Duration::from_millis(200),
            },
            CancellationToken::new(),
        );
        relay.start().await.unwrap();

        Harness {
            relay,
            backend,
            transport,
            tracker,
            store,
            health,
        }
    }

    fn client(call: &str, session: &str, kind: MessageKind) -> SignalingMessage {
        SignalingMessage::from_client(
            CallId::from(call),
            SessionId::from(session),
            UserId::from("user-1"),
            kind,
            "",
        )
    }

    fn outbound(session: &str, payload: &str) -> SignalingMessage {
        client("call-1", session, MessageKind::Sdp).reply(MessageKind::Sdp, payload)
    }

    #[tokio::test]
    async fn test_first_frame_claims_and_hosts_locally() {
        let h = harness(OwnershipMode::Active).await;

        h.relay
            .handle_client_frame(client("call-1", "s1", MessageKind::Join))
            .await
            .unwrap();

        assert_eq!(
            h.tracker.owner_of(&CallId::from("call-1")).await,
            CallOwner::Node(NodeId::from("node-a"))
        );
        assert_eq!(h.backend.received().len(), 1);
        assert_eq!(h.relay.hosted_calls().await, vec![CallId::from("call-1")]);
    }

    #[tokio::test]
    async fn test_last_leave_releases_call() {
        let h = harness(OwnershipMode::Active).await;
        let call = CallId::from("call-1");

        h.relay
            .handle_client_frame(client("call-1", "s1", MessageKind::Join))
            .await
            .unwrap();
        h.relay
            .handle_client_frame(client("call-1", "s2", MessageKind::Join))
            .await
            .unwrap();
        h.relay
            .handle_client_frame(client("call-1", "s1", MessageKind::Leave))
            .await
            .unwrap();
        assert!(h.store.call_records().await.unwrap().iter().any(|r| r.call_id == call));

        h.relay
            .handle_client_frame(client("call-1", "s2", MessageKind::Leave))
            .await
            .unwrap();
        assert!(h.store.call_records().await.unwrap().is_empty());
        assert!(h.relay.hosted_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_owned_by_peer_is_forwarded() {
        let h = harness(OwnershipMode::Active).await;
        let mut events = h.store.subscribe().await.unwrap();
        let call = CallId::from("call-9");
        h.store
            .claim_call(&call, &NodeId::from("node-b"))
            .await
            .unwrap();
        let _claimed = events.recv().await.unwrap();

        h.relay
            .handle_client_frame(client("call-9", "s1", MessageKind::Join))
            .await
            .unwrap();

        assert!(h.backend.received().is_empty());
        let forwarded = events.recv().await.unwrap();
        assert!(matches!(
            forwarded.kind,
            ClusterEventKind::ForwardToHost { ref target, .. } if target.as_str() == "node-b"
        ));
    }

    #[tokio::test]
    async fn test_forwarded_frame_is_never_forwarded_again() {
        let h = harness(OwnershipMode::Active).await;
        let call = CallId::from("call-9");
        h.store
            .claim_call(&call, &NodeId::from("node-b"))
            .await
            .unwrap();
        h.tracker
            .apply_claimed(&call, &NodeId::from("node-b"), 1)
            .await;

        h.relay
            .inject_forwarded(client("call-9", "s1", MessageKind::Sdp))
            .await
            .unwrap();
        assert!(h.backend.received().is_empty());
    }

    #[tokio::test]
    async fn test_daemon_mode_always_sends_to_backend() {
        let h = harness(OwnershipMode::Inert).await;

        h.relay
            .handle_client_frame(client("call-1", "s1", MessageKind::Sdp))
            .await
            .unwrap();

        assert_eq!(h.backend.received().len(), 1);
        assert!(h.store.call_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_order_preserved_and_failure_isolated() {
        let h = harness(OwnershipMode::Active).await;
        h.transport.connect("s1");
        h.transport.connect("s2");
        let tx = h.backend.sender();

        tx.send(outbound("s1", "m1")).await.unwrap();
        tx.send(outbound("s2", "x1")).await.unwrap();
        tx.send(outbound("s1", "fail")).await.unwrap();
        tx.send(outbound("s2", "x2")).await.unwrap();
        tx.send(outbound("s1", "m3")).await.unwrap();

        h.relay.shutdown().await;

        assert_eq!(h.transport.delivered_to("s1"), vec!["m1", "m3"]);
        assert_eq!(h.transport.delivered_to("s2"), vec!["x1", "x2"]);
    }

    #[tokio::test]
    async fn test_remote_session_is_published() {
        let h = harness(OwnershipMode::Active).await;
        let mut events = h.store.subscribe().await.unwrap();

        h.backend.sender().send(outbound("remote", "m1")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            ClusterEventKind::DeliverToClient { ref message } if message.payload == "m1"
        ));
    }

    #[tokio::test]
    async fn test_close_frame_retires_writer() {
        let h = harness(OwnershipMode::Active).await;
        h.transport.connect("s1");
        let tx = h.backend.sender();

        tx.send(outbound("s1", "m1")).await.unwrap();
        tx.send(client("call-1", "s1", MessageKind::Leave).reply(MessageKind::Close, "bye"))
            .await
            .unwrap();

        for _ in 0..50 {
            if h.transport.delivered_to("s1").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.transport.delivered_to("s1"), vec!["m1", "bye"]);
        assert_eq!(h.relay.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_backend_termination_stops_relay_and_clears_readiness() {
        let h = harness(OwnershipMode::Active).await;
        assert!(h.health.is_ready());

        h.backend.terminate();
        for _ in 0..50 {
            if h.relay.is_terminated() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(h.relay.is_terminated());
        assert!(!h.health.is_ready());
        assert!(matches!(
            h.relay
                .handle_client_frame(client("call-1", "s1", MessageKind::Join))
                .await,
            Err(CallsError::BackendTerminated)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(OwnershipMode::Active).await;
        assert!(matches!(h.relay.start().await, Err(CallsError::Internal(_))));
    }
}
