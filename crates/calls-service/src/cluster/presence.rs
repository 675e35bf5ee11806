//! Node presence heartbeat and departed-node sweep.
//!
//! Every node refreshes a presence lease of three heartbeat intervals. The
//! single handler additionally sweeps ownership records whose owner has no
//! live presence: a crashed node never broadcasts `NodeLeft` itself.

use crate::bootstrap::reconciler::{CleanupScope, ClusterStateReconciler};
use crate::cluster::store::{ClusterEventKind, CoordinationStore};
use crate::errors::CallsError;
use common::types::NodeId;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Presence lease, in heartbeat intervals.
pub const PRESENCE_TTL_INTERVALS: u32 = 3;

pub struct NodePresence {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    reconciler: Arc<ClusterStateReconciler>,
    interval: Duration,
}

impl NodePresence {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn CoordinationStore>,
        reconciler: Arc<ClusterStateReconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            reconciler,
            interval,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.interval.saturating_mul(PRESENCE_TTL_INTERVALS)
    }

    /// Refresh this node's presence, announcing `NodeJoined` the first time.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::CoordinationUnavailable` if the store is unreachable.
    pub async fn beat(&self) -> Result<(), CallsError> {
        let joined = self.store.refresh_presence(&self.node_id, self.ttl()).await?;
        if joined {
            self.store
                .publish(&self.node_id, ClusterEventKind::NodeJoined)
                .await?;
            info!(target: "calls.cluster.presence", node_id = %self.node_id, "Node presence announced");
        }
        Ok(())
    }

    /// Evict records owned by nodes without live presence and broadcast
    /// `NodeLeft` for each. Only the single handler sweeps.
    ///
    /// # Errors
    ///
    /// Returns the first store or cleanup error; nodes already processed stay
    /// processed.
    pub async fn sweep(&self) -> Result<Vec<NodeId>, CallsError> {
        if !self.reconciler.is_single_handler() {
            return Ok(Vec::new());
        }

        let live: HashSet<NodeId> = self.store.live_nodes().await?.into_iter().collect();
        let departed: BTreeSet<NodeId> = self
            .store
            .call_records()
            .await?
            .into_iter()
            .map(|record| record.owner)
            .filter(|owner| *owner != self.node_id && !live.contains(owner))
            .collect();

        for node in &departed {
            let report = self.reconciler.clean_up(CleanupScope::Node(node.clone())).await?;
            self.store
                .publish(
                    &self.node_id,
                    ClusterEventKind::NodeLeft { node: node.clone() },
                )
                .await?;
            info!(
                target: "calls.cluster.presence",
                node = %node,
                removed = report.removed.len(),
                "Swept departed node"
            );
        }
        Ok(departed.into_iter().collect())
    }

    /// Withdraw presence and announce departure. Used on clean shutdown.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::CoordinationUnavailable` if the store is unreachable.
    pub async fn leave(&self) -> Result<(), CallsError> {
        self.store.remove_presence(&self.node_id).await?;
        self.store
            .publish(
                &self.node_id,
                ClusterEventKind::NodeLeft {
                    node: self.node_id.clone(),
                },
            )
            .await?;
        info!(target: "calls.cluster.presence", node_id = %self.node_id, "Node presence withdrawn");
        Ok(())
    }
}

/// Heartbeat and sweep on every interval until cancelled.
#[instrument(skip_all, name = "calls.cluster.presence")]
pub async fn start_presence_heartbeat(presence: Arc<NodePresence>, cancel_token: CancellationToken) {
    info!(
        target: "calls.cluster.presence",
        interval_ms = u64::try_from(presence.interval.as_millis()).unwrap_or(u64::MAX),
        "Starting presence heartbeat"
    );

    let mut ticker = tokio::time::interval(presence.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = presence.beat().await {
                    warn!(target: "calls.cluster.presence", error = %e, "Presence heartbeat failed");
                    continue;
                }
                match presence.sweep().await {
                    Ok(departed) if !departed.is_empty() => {
                        debug!(target: "calls.cluster.presence", departed = departed.len(), "Sweep complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "calls.cluster.presence", error = %e, "Departed node sweep failed");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "calls.cluster.presence", "Presence heartbeat received shutdown signal, exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCoordinationStore;
    use crate::cluster::mutex::{DistributedMutex, MutexConfig};
    use common::types::CallId;

    fn presence(
        store: &Arc<MemoryCoordinationStore>,
        node: &str,
        single_handler: bool,
    ) -> NodePresence {
        let dyn_store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
        let node = NodeId::from(node);
        let reconciler = Arc::new(ClusterStateReconciler::new(
            Arc::clone(&dyn_store),
            DistributedMutex::new(
                Arc::clone(&dyn_store),
                node.clone(),
                MutexConfig::with_lease(Duration::from_secs(10)),
            ),
            node.clone(),
            Duration::from_secs(1),
            single_handler,
        ));
        NodePresence::new(node, dyn_store, reconciler, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_first_beat_announces_join_once() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut events = store.subscribe().await.unwrap();
        let p = presence(&store, "node-a", false);

        p.beat().await.unwrap();
        p.beat().await.unwrap();

        let joined = events.recv().await.unwrap();
        assert_eq!(joined.kind, ClusterEventKind::NodeJoined);
        assert_eq!(joined.origin, NodeId::from("node-a"));
        assert!(events.try_recv().is_err());
        assert_eq!(store.live_nodes().await.unwrap(), vec![NodeId::from("node-a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired_owner() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let handler = presence(&store, "node-a", true);
        let peer = presence(&store, "node-b", false);

        handler.beat().await.unwrap();
        peer.beat().await.unwrap();
        store
            .claim_call(&CallId::from("call-b"), &NodeId::from("node-b"))
            .await
            .unwrap();

        // Peer alive: nothing to sweep
        assert!(handler.sweep().await.unwrap().is_empty());

        // Peer stops heartbeating past its TTL
        tokio::time::advance(peer.ttl() + Duration::from_secs(1)).await;
        handler.beat().await.unwrap();

        let departed = handler.sweep().await.unwrap();
        assert_eq!(departed, vec![NodeId::from("node-b")]);
        assert!(store.call_records().await.unwrap().is_empty());

        // Second sweep is a no-op
        assert!(handler.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_handler_never_sweeps() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let p = presence(&store, "node-a", false);
        store
            .claim_call(&CallId::from("call-x"), &NodeId::from("node-gone"))
            .await
            .unwrap();

        assert!(p.sweep().await.unwrap().is_empty());
        assert_eq!(store.call_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_withdraws_and_announces() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let p = presence(&store, "node-a", false);
        p.beat().await.unwrap();
        let mut events = store.subscribe().await.unwrap();

        p.leave().await.unwrap();

        assert!(store.live_nodes().await.unwrap().is_empty());
        let left = events.recv().await.unwrap();
        assert_eq!(
            left.kind,
            ClusterEventKind::NodeLeft {
                node: NodeId::from("node-a")
            }
        );
    }
}
