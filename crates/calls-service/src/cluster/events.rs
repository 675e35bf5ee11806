//! Cluster event consumer.
//!
//! Applies peer ownership changes to the local tracker, invalidates records of
//! departed nodes, and hands cross-node signaling to the relay. Delivery may be
//! duplicated or reordered; ownership updates are guarded by the store-assigned
//! sequence so replays are harmless.

use crate::bootstrap::reconciler::{CleanupScope, ClusterStateReconciler};
use crate::cluster::store::{ClusterEvent, ClusterEventKind, CoordinationStore};
use crate::observability::metrics;
use crate::ownership::NodeOwnershipTracker;
use crate::relay::SignalingRelay;
use common::types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Initial delay before resubscribing after the feed drops.
const RESUBSCRIBE_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum delay between resubscribe attempts.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct ClusterEventHandler {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    tracker: Arc<NodeOwnershipTracker>,
    reconciler: Arc<ClusterStateReconciler>,
    relay: Option<Arc<SignalingRelay>>,
}

impl ClusterEventHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        tracker: Arc<NodeOwnershipTracker>,
        reconciler: Arc<ClusterStateReconciler>,
    ) -> Self {
        Self {
            node_id: tracker.node_id().clone(),
            store,
            tracker,
            reconciler,
            relay: None,
        }
    }

    /// Route cross-node signaling through `relay`. Without a relay, signaling
    /// events are ignored.
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<SignalingRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Consume the feed until cancelled, resubscribing when it drops.
    #[instrument(skip_all, name = "calls.cluster.events", fields(node_id = %self.node_id))]
    pub async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        info!(target: "calls.cluster.events", "Cluster event handler started");
        let mut failures: u32 = 0;

        loop {
            let mut events = match self.store.subscribe().await {
                Ok(events) => {
                    failures = 0;
                    self.resync().await;
                    events
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = resubscribe_backoff(failures);
                    warn!(
                        target: "calls.cluster.events",
                        error = %e,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Cluster event subscription failed"
                    );
                    tokio::select! {
                        () = cancel_token.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!(target: "calls.cluster.events", "Cluster event handler received shutdown signal, exiting");
                        return;
                    }
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            warn!(target: "calls.cluster.events", "Cluster event feed closed, resubscribing");
                            break;
                        }
                    }
                }
            }
        }

        info!(target: "calls.cluster.events", "Cluster event handler stopped");
    }

    /// Seed the tracker from persisted records. Events broadcast while the
    /// subscription was down would otherwise be lost.
    async fn resync(&self) {
        match self.store.call_records().await {
            Ok(records) => {
                let mut applied = 0usize;
                for record in records {
                    if self
                        .tracker
                        .apply_claimed(&record.call_id, &record.owner, record.seq)
                        .await
                    {
                        applied += 1;
                    }
                }
                let pruned = self.tracker.prune_tombstones().await;
                debug!(
                    target: "calls.cluster.events",
                    applied = applied,
                    pruned = pruned,
                    "Ownership resynced from store"
                );
            }
            Err(e) => {
                warn!(target: "calls.cluster.events", error = %e, "Ownership resync failed, relying on broadcasts");
            }
        }
    }

    /// Apply one event.
    pub async fn handle_event(&self, event: ClusterEvent) {
        let label = event.kind.as_label();
        let result = match event.kind {
            ClusterEventKind::NodeJoined => {
                debug!(target: "calls.cluster.events", node = %event.origin, "Node joined");
                "applied"
            }
            ClusterEventKind::NodeLeft { node } if node == self.node_id => "ignored",
            ClusterEventKind::NodeLeft { node } => {
                self.on_node_left(node).await;
                "applied"
            }
            ClusterEventKind::OwnershipClaimed { call_id, node } => {
                if self.tracker.apply_claimed(&call_id, &node, event.seq).await {
                    "applied"
                } else {
                    "stale"
                }
            }
            ClusterEventKind::OwnershipReleased { call_id, node } => {
                if self.tracker.apply_released(&call_id, &node, event.seq).await {
                    "applied"
                } else {
                    "stale"
                }
            }
            ClusterEventKind::ForwardToHost { target, message } if target == self.node_id => {
                match &self.relay {
                    Some(relay) => match relay.inject_forwarded(message).await {
                        Ok(()) => "applied",
                        Err(e) => {
                            warn!(
                                target: "calls.cluster.events",
                                origin = %event.origin,
                                error = %e,
                                "Failed to inject forwarded frame"
                            );
                            "failed"
                        }
                    },
                    None => "ignored",
                }
            }
            ClusterEventKind::ForwardToHost { .. } => "ignored",
            ClusterEventKind::DeliverToClient { message } => match &self.relay {
                Some(relay) if event.origin != self.node_id => {
                    relay.deliver_to_client(message).await;
                    "applied"
                }
                _ => "ignored",
            },
        };

        metrics::record_cluster_event(label, result);
    }

    async fn on_node_left(&self, node: NodeId) {
        let invalidated = self.tracker.invalidate_node(&node).await;
        info!(
            target: "calls.cluster.events",
            node = %node,
            invalidated = invalidated.len(),
            "Peer node left, ownership invalidated"
        );

        if self.reconciler.is_single_handler() {
            // Cleanup waits on a cluster lock; keep the feed moving meanwhile
            let reconciler = Arc::clone(&self.reconciler);
            tokio::spawn(async move {
                if let Err(e) = reconciler.clean_up(CleanupScope::Node(node)).await {
                    warn!(target: "calls.cluster.events", error = %e, "Departed node cleanup failed");
                }
            });
        }
    }
}

fn resubscribe_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    RESUBSCRIBE_BACKOFF_BASE
        .saturating_mul(factor)
        .min(RESUBSCRIBE_BACKOFF_MAX)
}
