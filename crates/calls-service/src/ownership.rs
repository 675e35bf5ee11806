//! Per-call node ownership.
//!
//! Claims and releases go through the coordination store, which decides
//! first-writer-wins atomically and broadcasts the change. The local table is
//! a cache of those broadcasts: every entry carries the sequence of the event
//! that produced it, and an update only applies if its sequence is newer. A
//! release leaves a tombstone with its sequence so a late-delivered claim
//! cannot resurrect the record. Tombstones are pruned once they are older than
//! [`TOMBSTONE_RETENTION`]; by then every in-flight claim has been delivered.
//!
//! With the external media daemon the tracker is inert: the daemon hosts every
//! call, nothing is recorded and every lookup answers [`CallOwner::Daemon`].

use crate::cluster::store::{ClaimOutcome, CoordinationStore, ReleaseOutcome};
use crate::errors::CallsError;
use crate::observability::metrics;
use common::types::{CallId, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// How long a release tombstone is kept.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

/// Whether ownership is tracked at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipMode {
    /// Embedded engine: calls are pinned to the node that hosts them.
    Active,
    /// External daemon: the daemon is the implicit owner of every call.
    Inert,
}

/// Answer to "who hosts this call?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOwner {
    Node(NodeId),
    Daemon,
    Unknown,
}

#[derive(Debug, Clone)]
struct Entry {
    /// `None` is a tombstone.
    owner: Option<NodeId>,
    seq: u64,
    updated_at: Instant,
}

impl Entry {
    fn is_expired_tombstone(&self, now: Instant) -> bool {
        self.owner.is_none() && now.duration_since(self.updated_at) >= TOMBSTONE_RETENTION
    }
}

/// Node-local view of call ownership.
pub struct NodeOwnershipTracker {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    mode: OwnershipMode,
    entries: RwLock<HashMap<CallId, Entry>>,
}

impl NodeOwnershipTracker {
    #[must_use]
    pub fn new(node_id: NodeId, store: Arc<dyn CoordinationStore>, mode: OwnershipMode) -> Self {
        Self {
            node_id,
            store,
            mode,
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    #[must_use]
    pub fn mode(&self) -> OwnershipMode {
        self.mode
    }

    /// Record this node as owner of `call_id`.
    ///
    /// Claiming a call this node already owns succeeds.
    ///
    /// # Errors
    ///
    /// - `CallsError::OwnershipConflict` if another node owns the call
    /// - `CallsError::CoordinationUnavailable` if the store is unreachable
    #[instrument(skip_all, fields(call_id = %call_id))]
    pub async fn claim(&self, call_id: &CallId) -> Result<(), CallsError> {
        if self.mode == OwnershipMode::Inert {
            return Ok(());
        }

        match self.store.claim_call(call_id, &self.node_id).await? {
            ClaimOutcome::Claimed { seq } => {
                self.apply_claimed(call_id, &self.node_id, seq).await;
                debug!(
                    target: "calls.ownership",
                    call_id = %call_id,
                    seq = seq,
                    "Claimed call ownership"
                );
                Ok(())
            }
            ClaimOutcome::Conflict { owner } => {
                metrics::record_ownership_conflict();
                warn!(
                    target: "calls.ownership",
                    call_id = %call_id,
                    owner = %owner,
                    "Ownership claim rejected, call hosted elsewhere"
                );
                Err(CallsError::OwnershipConflict {
                    call_id: call_id.clone(),
                    owner,
                })
            }
        }
    }

    /// Remove this node's record for `call_id`. Absent records and records
    /// owned by another node are left alone.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::CoordinationUnavailable` if the store is unreachable.
    #[instrument(skip_all, fields(call_id = %call_id))]
    pub async fn release(&self, call_id: &CallId) -> Result<(), CallsError> {
        if self.mode == OwnershipMode::Inert {
            return Ok(());
        }

        match self.store.release_call(call_id, &self.node_id).await? {
            ReleaseOutcome::Released { seq } => {
                self.apply_released(call_id, &self.node_id, seq).await;
                debug!(target: "calls.ownership", call_id = %call_id, seq = seq, "Released call ownership");
            }
            ReleaseOutcome::Absent => {}
            ReleaseOutcome::NotOwner { owner } => {
                debug!(
                    target: "calls.ownership",
                    call_id = %call_id,
                    owner = %owner,
                    "Release skipped, call owned by another node"
                );
            }
        }
        Ok(())
    }

    /// Current owner as known locally.
    pub async fn owner_of(&self, call_id: &CallId) -> CallOwner {
        if self.mode == OwnershipMode::Inert {
            return CallOwner::Daemon;
        }
        match self.entries.read().await.get(call_id) {
            Some(Entry {
                owner: Some(node), ..
            }) => CallOwner::Node(node.clone()),
            _ => CallOwner::Unknown,
        }
    }

    /// Apply a claim broadcast. Returns `false` if the event is stale.
    pub async fn apply_claimed(&self, call_id: &CallId, node: &NodeId, seq: u64) -> bool {
        self.apply(call_id, Some(node.clone()), seq).await
    }

    /// Apply a release broadcast. Returns `false` if the event is stale.
    pub async fn apply_released(&self, call_id: &CallId, _node: &NodeId, seq: u64) -> bool {
        self.apply(call_id, None, seq).await
    }

    async fn apply(&self, call_id: &CallId, owner: Option<NodeId>, seq: u64) -> bool {
        if self.mode == OwnershipMode::Inert {
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries
            .get(call_id)
            .is_some_and(|e| e.seq >= seq && !e.is_expired_tombstone(now))
        {
            return false;
        }
        let released = owner.is_none();
        entries.insert(
            call_id.clone(),
            Entry {
                owner,
                seq,
                updated_at: now,
            },
        );
        if released {
            entries.retain(|_, e| !e.is_expired_tombstone(now));
        }
        metrics::set_owned_calls(self.count_owned(&entries));
        true
    }

    /// Drop tombstones older than [`TOMBSTONE_RETENTION`]. Returns how many
    /// were removed.
    pub async fn prune_tombstones(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_tombstone(now));
        before - entries.len()
    }

    /// Number of call ids with local state, tombstones included.
    pub async fn tracked_calls(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop every record owned by `node` (it can no longer serve those
    /// sessions). Returns the invalidated call ids.
    pub async fn invalidate_node(&self, node: &NodeId) -> Vec<CallId> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut invalidated = Vec::new();
        for (call_id, entry) in entries.iter_mut() {
            if entry.owner.as_ref() == Some(node) {
                entry.owner = None;
                entry.updated_at = now;
                invalidated.push(call_id.clone());
            }
        }
        entries.retain(|_, e| !e.is_expired_tombstone(now));
        metrics::set_owned_calls(self.count_owned(&entries));
        invalidated
    }

    /// Forget everything, tombstones included.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = entries.values().filter(|e| e.owner.is_some()).count();
        entries.clear();
        metrics::set_owned_calls(0);
        removed
    }

    /// Calls this node hosts.
    pub async fn owned_calls(&self) -> Vec<CallId> {
        let entries = self.entries.read().await;
        let mut calls: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.owner.as_ref() == Some(&self.node_id))
            .map(|(id, _)| id.clone())
            .collect();
        calls.sort();
        calls
    }

    fn count_owned(&self, entries: &HashMap<CallId, Entry>) -> usize {
        entries
            .values()
            .filter(|e| e.owner.as_ref() == Some(&self.node_id))
            .count()
    }
}
