//! Stale call-state cleanup.
//!
//! Runs only on the designated single handler and only while holding the
//! `cleanup_state` cluster lock. Every run reads the current records and
//! evicts the ones in scope, so a second run with nothing left to remove is a
//! no-op that reports zero removals.

use crate::cluster::mutex::DistributedMutex;
use crate::cluster::store::{CallRecord, CoordinationStore};
use crate::errors::CallsError;
use crate::observability::metrics;
use common::types::{CallId, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Cluster lock guarding cleanup.
pub const CLEANUP_LOCK: &str = "cleanup_state";

/// Which records a cleanup run removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    /// Records created before this process started that are owned by this
    /// node or by a node with no live presence. Calls cannot survive a
    /// restart of their host.
    PreIncarnation { started_at_ms: i64 },
    /// Every ownership record. Used when the external daemon takes over
    /// hosting and embedded bookkeeping becomes meaningless.
    AllOwnership,
    /// Records owned by one departed node.
    Node(NodeId),
}

impl CleanupScope {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            CleanupScope::PreIncarnation { .. } => "pre_incarnation",
            CleanupScope::AllOwnership => "all_ownership",
            CleanupScope::Node(_) => "node",
        }
    }
}

/// Outcome of one cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<CallId>,
}

impl CleanupReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
    }
}

pub struct ClusterStateReconciler {
    store: Arc<dyn CoordinationStore>,
    mutex: DistributedMutex,
    node_id: NodeId,
    lock_timeout: Duration,
    single_handler: bool,
}

impl ClusterStateReconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        mutex: DistributedMutex,
        node_id: NodeId,
        lock_timeout: Duration,
        single_handler: bool,
    ) -> Self {
        Self {
            store,
            mutex,
            node_id,
            lock_timeout,
            single_handler,
        }
    }

    #[must_use]
    pub fn is_single_handler(&self) -> bool {
        self.single_handler
    }

    /// Remove stale records in `scope`. Nodes that are not the single handler
    /// return an empty report without touching the store.
    ///
    /// # Errors
    ///
    /// - `CallsError::LockTimeout` if the cleanup lock is busy past the timeout
    /// - `CallsError::CoordinationUnavailable` if the store is unreachable
    #[instrument(skip_all, name = "calls.reconciler.clean_up", fields(scope = scope.as_label()))]
    pub async fn clean_up(&self, scope: CleanupScope) -> Result<CleanupReport, CallsError> {
        if !self.single_handler {
            debug!(target: "calls.reconciler", "Not the single handler, skipping cleanup");
            return Ok(CleanupReport::default());
        }

        let report = self
            .mutex
            .run_locked(CLEANUP_LOCK, self.lock_timeout, || self.clean_up_locked(&scope))
            .await?;

        metrics::record_cleanup(scope.as_label(), report.removed.len());
        info!(
            target: "calls.reconciler",
            scope = scope.as_label(),
            removed = report.removed.len(),
            "Cluster state cleanup complete"
        );
        Ok(report)
    }

    async fn clean_up_locked(&self, scope: &CleanupScope) -> Result<CleanupReport, CallsError> {
        let records = self.store.call_records().await?;
        if records.is_empty() {
            return Ok(CleanupReport::default());
        }

        let live: HashSet<NodeId> = match scope {
            CleanupScope::PreIncarnation { .. } => {
                self.store.live_nodes().await?.into_iter().collect()
            }
            _ => HashSet::new(),
        };

        let mut report = CleanupReport::default();
        for record in records.iter().filter(|r| self.is_stale(r, scope, &live)) {
            if self
                .store
                .evict_call(&record.call_id, &self.node_id)
                .await?
                .is_some()
            {
                debug!(
                    target: "calls.reconciler",
                    call_id = %record.call_id,
                    owner = %record.owner,
                    "Evicted stale call record"
                );
                report.removed.push(record.call_id.clone());
            }
        }
        Ok(report)
    }

    fn is_stale(&self, record: &CallRecord, scope: &CleanupScope, live: &HashSet<NodeId>) -> bool {
        match scope {
            CleanupScope::PreIncarnation { started_at_ms } => {
                record.created_at_ms < *started_at_ms
                    && (record.owner == self.node_id || !live.contains(&record.owner))
            }
            CleanupScope::AllOwnership => true,
            CleanupScope::Node(node) => &record.owner == node,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCoordinationStore;
    use crate::cluster::mutex::MutexConfig;

    fn reconciler(store: &Arc<MemoryCoordinationStore>, single_handler: bool) -> ClusterStateReconciler {
        let store_dyn = Arc::clone(store) as Arc<dyn CoordinationStore>;
        let node = NodeId::from("node-a");
        ClusterStateReconciler::new(
            Arc::clone(&store_dyn),
            DistributedMutex::new(
                store_dyn,
                node.clone(),
                MutexConfig::with_lease(Duration::from_secs(10)),
            ),
            node,
            Duration::from_secs(1),
            single_handler,
        )
    }

    #[tokio::test]
    async fn test_empty_store_is_noop() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let report = reconciler(&store, true)
            .clean_up(CleanupScope::AllOwnership)
            .await
            .unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_node_scope_only_removes_that_node() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store
            .claim_call(&CallId::from("c1"), &NodeId::from("node-b"))
            .await
            .unwrap();
        store
            .claim_call(&CallId::from("c2"), &NodeId::from("node-c"))
            .await
            .unwrap();

        let report = reconciler(&store, true)
            .clean_up(CleanupScope::Node(NodeId::from("node-b")))
            .await
            .unwrap();

        assert_eq!(report.removed, vec![CallId::from("c1")]);
        let left = store.call_records().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left.first().unwrap().call_id, CallId::from("c2"));
    }

    #[tokio::test]
    async fn test_pre_incarnation_keeps_live_peers_and_new_records() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let live_peer = NodeId::from("node-live");
        store
            .refresh_presence(&live_peer, Duration::from_secs(60))
            .await
            .unwrap();

        store
            .claim_call(&CallId::from("own-old"), &NodeId::from("node-a"))
            .await
            .unwrap();
        store
            .claim_call(&CallId::from("dead-old"), &NodeId::from("node-dead"))
            .await
            .unwrap();
        store
            .claim_call(&CallId::from("peer-old"), &live_peer)
            .await
            .unwrap();

        let started_at_ms = chrono::Utc::now().timestamp_millis() + 1;
        let report = reconciler(&store, true)
            .clean_up(CleanupScope::PreIncarnation { started_at_ms })
            .await
            .unwrap();

        let mut removed = report.removed;
        removed.sort();
        assert_eq!(removed, vec![CallId::from("dead-old"), CallId::from("own-old")]);

        let left = store.call_records().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left.first().unwrap().owner, live_peer);
    }

    #[tokio::test]
    async fn test_non_handler_skips() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store
            .claim_call(&CallId::from("c1"), &NodeId::from("node-b"))
            .await
            .unwrap();

        let report = reconciler(&store, false)
            .clean_up(CleanupScope::AllOwnership)
            .await
            .unwrap();
        assert!(report.is_noop());
        assert_eq!(store.call_records().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_times_out() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store
            .try_lock(CLEANUP_LOCK, "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let result = reconciler(&store, true)
            .clean_up(CleanupScope::AllOwnership)
            .await;
        assert!(matches!(result, Err(CallsError::LockTimeout { .. })));
    }
}
