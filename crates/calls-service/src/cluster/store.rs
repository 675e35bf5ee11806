//! Cluster coordination store contract.
//!
//! The store is the only cross-node shared mutable resource. It backs named
//! locks, per-call ownership records, node presence, and the broadcast channel
//! that carries [`ClusterEvent`]s between nodes.
//!
//! Ownership changes are assigned a cluster-monotonic sequence number and
//! broadcast in the same atomic step as the record write, so every subscriber
//! observes claims and releases in an order consistent with the records.

use crate::errors::CallsError;
use crate::signaling::SignalingMessage;
use async_trait::async_trait;
use common::types::{CallId, NodeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffer size for a subscriber's event channel.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// What happened in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEventKind {
    /// A node started heartbeating.
    NodeJoined,
    /// A node left (clean shutdown or swept after its presence expired).
    NodeLeft { node: NodeId },
    /// `node` now hosts `call_id`.
    OwnershipClaimed { call_id: CallId, node: NodeId },
    /// `node` no longer hosts `call_id`.
    OwnershipReleased { call_id: CallId, node: NodeId },
    /// Client frame that must be injected on the node hosting the call.
    ForwardToHost {
        target: NodeId,
        message: SignalingMessage,
    },
    /// Backend frame for a session whose transport lives on another node.
    DeliverToClient { message: SignalingMessage },
}

impl ClusterEventKind {
    /// Bounded label value for metrics.
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            ClusterEventKind::NodeJoined => "node_joined",
            ClusterEventKind::NodeLeft { .. } => "node_left",
            ClusterEventKind::OwnershipClaimed { .. } => "ownership_claimed",
            ClusterEventKind::OwnershipReleased { .. } => "ownership_released",
            ClusterEventKind::ForwardToHost { .. } => "forward_to_host",
            ClusterEventKind::DeliverToClient { .. } => "deliver_to_client",
        }
    }
}

/// Envelope broadcast to every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Cluster-monotonic sequence assigned by the store.
    pub seq: u64,
    /// Node that published the event.
    pub origin: NodeId,
    #[serde(flatten)]
    pub kind: ClusterEventKind,
}

/// Persisted ownership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub owner: NodeId,
    /// Sequence of the claim that created the record.
    pub seq: u64,
    /// Wall-clock creation time in unix milliseconds.
    pub created_at_ms: i64,
}

/// Result of an atomic claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller is now the owner. Re-claiming an owned call returns the
    /// original sequence.
    Claimed { seq: u64 },
    /// Another node already owns the call.
    Conflict { owner: NodeId },
}

/// Result of an atomic release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { seq: u64 },
    /// No record existed.
    Absent,
    /// The record belongs to another node and was left untouched.
    NotOwner { owner: NodeId },
}

/// Shared coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Acquire `name` for `holder` if free or expired. Returns whether the
    /// lock was taken.
    async fn try_lock(&self, name: &str, holder: &str, lease: Duration)
        -> Result<bool, CallsError>;

    /// Extend the lease if `holder` still owns `name`.
    async fn renew_lock(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, CallsError>;

    /// Release `name` if `holder` still owns it.
    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, CallsError>;

    /// Record `node` as owner of `call_id` (first writer wins) and broadcast
    /// `OwnershipClaimed`.
    async fn claim_call(&self, call_id: &CallId, node: &NodeId)
        -> Result<ClaimOutcome, CallsError>;

    /// Remove the record if `node` owns it and broadcast `OwnershipReleased`.
    async fn release_call(
        &self,
        call_id: &CallId,
        node: &NodeId,
    ) -> Result<ReleaseOutcome, CallsError>;

    /// Remove the record regardless of owner (maintenance path) and broadcast
    /// `OwnershipReleased` on behalf of the previous owner. Returns the
    /// sequence, or `None` if nothing was removed.
    async fn evict_call(&self, call_id: &CallId, origin: &NodeId)
        -> Result<Option<u64>, CallsError>;

    /// All ownership records.
    async fn call_records(&self) -> Result<Vec<CallRecord>, CallsError>;

    /// Refresh this node's presence lease. Returns `true` if the node was not
    /// present before.
    async fn refresh_presence(&self, node: &NodeId, ttl: Duration) -> Result<bool, CallsError>;

    async fn remove_presence(&self, node: &NodeId) -> Result<(), CallsError>;

    /// Nodes with an unexpired presence lease.
    async fn live_nodes(&self) -> Result<Vec<NodeId>, CallsError>;

    /// Broadcast an event; the store assigns and returns its sequence.
    async fn publish(&self, origin: &NodeId, kind: ClusterEventKind) -> Result<u64, CallsError>;

    /// Subscribe to the broadcast channel. The receiver closes when the
    /// subscription is lost; callers resubscribe.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterEvent>, CallsError>;
}
