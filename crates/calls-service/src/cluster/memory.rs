//! In-process coordination store.
//!
//! Used when no `REDIS_URL` is configured (single-node deployments) and by
//! tests that simulate several nodes sharing one store. Lease expiry follows
//! `tokio::time`, so paused-clock tests can advance past a lease.

use crate::cluster::store::{
    CallRecord, ClaimOutcome, ClusterEvent, ClusterEventKind, CoordinationStore, ReleaseOutcome,
    SUBSCRIBER_BUFFER,
};
use crate::errors::CallsError;
use async_trait::async_trait;
use common::types::{CallId, NodeId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::warn;

/// Capacity of the internal broadcast ring.
const BROADCAST_CAPACITY: usize = 4096;

struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    locks: HashMap<String, Lease>,
    calls: HashMap<CallId, CallRecord>,
    presence: HashMap<NodeId, Instant>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Single-process [`CoordinationStore`].
pub struct MemoryCoordinationStore {
    state: Mutex<State>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Broadcast while the state lock is held so delivery order matches
    /// sequence order.
    fn emit(&self, seq: u64, origin: &NodeId, kind: ClusterEventKind) {
        // No receivers is not an error
        let _ = self.events.send(ClusterEvent {
            seq,
            origin: origin.clone(),
            kind,
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn try_lock(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, CallsError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let free = state
            .locks
            .get(name)
            .map_or(true, |l| l.expires_at <= now);
        if free {
            state.locks.insert(
                name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + lease,
                },
            );
        }
        Ok(free)
    }

    async fn renew_lock(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, CallsError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.locks.get_mut(name) {
            Some(l) if l.holder == holder && l.expires_at > now => {
                l.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, CallsError> {
        let mut state = self.state.lock().await;
        let held = state
            .locks
            .get(name)
            .is_some_and(|l| l.holder == holder && l.expires_at > Instant::now());
        if held {
            state.locks.remove(name);
        }
        Ok(held)
    }

    async fn claim_call(
        &self,
        call_id: &CallId,
        node: &NodeId,
    ) -> Result<ClaimOutcome, CallsError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.calls.get(call_id) {
            return Ok(if &record.owner == node {
                ClaimOutcome::Claimed { seq: record.seq }
            } else {
                ClaimOutcome::Conflict {
                    owner: record.owner.clone(),
                }
            });
        }

        let seq = state.next_seq();
        state.calls.insert(
            call_id.clone(),
            CallRecord {
                call_id: call_id.clone(),
                owner: node.clone(),
                seq,
                created_at_ms: chrono::Utc::now().timestamp_millis(),
            },
        );
        self.emit(
            seq,
            node,
            ClusterEventKind::OwnershipClaimed {
                call_id: call_id.clone(),
                node: node.clone(),
            },
        );
        Ok(ClaimOutcome::Claimed { seq })
    }

    async fn release_call(
        &self,
        call_id: &CallId,
        node: &NodeId,
    ) -> Result<ReleaseOutcome, CallsError> {
        let mut state = self.state.lock().await;
        match state.calls.get(call_id) {
            None => return Ok(ReleaseOutcome::Absent),
            Some(record) if &record.owner != node => {
                return Ok(ReleaseOutcome::NotOwner {
                    owner: record.owner.clone(),
                })
            }
            Some(_) => {}
        }

        state.calls.remove(call_id);
        let seq = state.next_seq();
        self.emit(
            seq,
            node,
            ClusterEventKind::OwnershipReleased {
                call_id: call_id.clone(),
                node: node.clone(),
            },
        );
        Ok(ReleaseOutcome::Released { seq })
    }

    async fn evict_call(
        &self,
        call_id: &CallId,
        origin: &NodeId,
    ) -> Result<Option<u64>, CallsError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.calls.remove(call_id) else {
            return Ok(None);
        };
        let seq = state.next_seq();
        self.emit(
            seq,
            origin,
            ClusterEventKind::OwnershipReleased {
                call_id: call_id.clone(),
                node: record.owner,
            },
        );
        Ok(Some(seq))
    }

    async fn call_records(&self) -> Result<Vec<CallRecord>, CallsError> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.calls.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    async fn refresh_presence(&self, node: &NodeId, ttl: Duration) -> Result<bool, CallsError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let previous = state.presence.insert(node.clone(), now + ttl);
        Ok(previous.map_or(true, |expires_at| expires_at <= now))
    }

    async fn remove_presence(&self, node: &NodeId) -> Result<(), CallsError> {
        self.state.lock().await.presence.remove(node);
        Ok(())
    }

    async fn live_nodes(&self) -> Result<Vec<NodeId>, CallsError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut nodes: Vec<_> = state
            .presence
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn publish(&self, origin: &NodeId, kind: ClusterEventKind) -> Result<u64, CallsError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        self.emit(seq, origin, kind);
        Ok(seq)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterEvent>, CallsError> {
        let mut source = self.events.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "calls.cluster.memory",
                            skipped = skipped,
                            "Subscriber lagged, cluster events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlock() {
        let store = MemoryCoordinationStore::new();

        assert!(store.try_lock("ensure_bot", "a", LEASE).await.unwrap());
        assert!(!store.try_lock("ensure_bot", "b", LEASE).await.unwrap());

        // Only the holder can unlock
        assert!(!store.unlock("ensure_bot", "b").await.unwrap());
        assert!(store.unlock("ensure_bot", "a").await.unwrap());
        assert!(store.try_lock("ensure_bot", "b", LEASE).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimable() {
        let store = MemoryCoordinationStore::new();
        assert!(store.try_lock("cleanup_state", "a", LEASE).await.unwrap());

        tokio::time::advance(LEASE + Duration::from_millis(1)).await;

        assert!(store.try_lock("cleanup_state", "b", LEASE).await.unwrap());
        // The crashed holder can no longer renew or release
        assert!(!store.renew_lock("cleanup_state", "a", LEASE).await.unwrap());
        assert!(!store.unlock("cleanup_state", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let store = MemoryCoordinationStore::new();
        assert!(store.try_lock("l", "a", LEASE).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.renew_lock("l", "a", LEASE).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(!store.try_lock("l", "b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_conflict_and_release() {
        let store = MemoryCoordinationStore::new();
        let call = CallId::from("call-1");
        let a = NodeId::from("node-a");
        let b = NodeId::from("node-b");

        let first = store.claim_call(&call, &a).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed { .. }));

        // Re-claim by the owner returns the original sequence
        assert_eq!(store.claim_call(&call, &a).await.unwrap(), first);

        assert_eq!(
            store.claim_call(&call, &b).await.unwrap(),
            ClaimOutcome::Conflict { owner: a.clone() }
        );
        assert_eq!(
            store.release_call(&call, &b).await.unwrap(),
            ReleaseOutcome::NotOwner { owner: a.clone() }
        );

        assert!(matches!(
            store.release_call(&call, &a).await.unwrap(),
            ReleaseOutcome::Released { .. }
        ));
        assert_eq!(
            store.release_call(&call, &a).await.unwrap(),
            ReleaseOutcome::Absent
        );
        assert!(matches!(
            store.claim_call(&call, &b).await.unwrap(),
            ClaimOutcome::Claimed { .. }
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_sequence_order() {
        let store = MemoryCoordinationStore::new();
        let mut rx = store.subscribe().await.unwrap();
        let a = NodeId::from("node-a");

        store.claim_call(&CallId::from("c1"), &a).await.unwrap();
        store.publish(&a, ClusterEventKind::NodeJoined).await.unwrap();
        store.evict_call(&CallId::from("c1"), &a).await.unwrap();

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        let e3 = rx.recv().await.unwrap();
        assert!(e1.seq < e2.seq && e2.seq < e3.seq);
        assert!(matches!(e1.kind, ClusterEventKind::OwnershipClaimed { .. }));
        assert_eq!(e2.kind, ClusterEventKind::NodeJoined);
        assert_eq!(
            e3.kind,
            ClusterEventKind::OwnershipReleased {
                call_id: CallId::from("c1"),
                node: a,
            }
        );
    }

    #[tokio::test]
    async fn test_evict_absent_is_none() {
        let store = MemoryCoordinationStore::new();
        let result = store
            .evict_call(&CallId::from("nope"), &NodeId::from("node-a"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_expires() {
        let store = MemoryCoordinationStore::new();
        let a = NodeId::from("node-a");
        let ttl = Duration::from_secs(15);

        assert!(store.refresh_presence(&a, ttl).await.unwrap());
        assert!(!store.refresh_presence(&a, ttl).await.unwrap());
        assert_eq!(store.live_nodes().await.unwrap(), vec![a.clone()]);

        tokio::time::advance(ttl + Duration::from_millis(1)).await;
        assert!(store.live_nodes().await.unwrap().is_empty());
        // Coming back after expiry counts as a join
        assert!(store.refresh_presence(&a, ttl).await.unwrap());
    }
}
