//! Coordination store that is never reachable.

use async_trait::async_trait;
use calls_service::cluster::{
    CallRecord, ClaimOutcome, ClusterEvent, ClusterEventKind, CoordinationStore, ReleaseOutcome,
};
use calls_service::errors::CallsError;
use common::types::{CallId, NodeId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Every operation fails with `CoordinationUnavailable`.
#[derive(Default)]
pub struct FailingStore {
    attempts: AtomicUsize,
}

impl FailingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, CallsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CallsError::CoordinationUnavailable(
            "connection refused".to_string(),
        ))
    }
}

#[async_trait]
impl CoordinationStore for FailingStore {
    async fn try_lock(&self, _: &str, _: &str, _: Duration) -> Result<bool, CallsError> {
        self.fail()
    }

    async fn renew_lock(&self, _: &str, _: &str, _: Duration) -> Result<bool, CallsError> {
        self.fail()
    }

    async fn unlock(&self, _: &str, _: &str) -> Result<bool, CallsError> {
        self.fail()
    }

    async fn claim_call(&self, _: &CallId, _: &NodeId) -> Result<ClaimOutcome, CallsError> {
        self.fail()
    }

    async fn release_call(&self, _: &CallId, _: &NodeId) -> Result<ReleaseOutcome, CallsError> {
        self.fail()
    }

    async fn evict_call(&self, _: &CallId, _: &NodeId) -> Result<Option<u64>, CallsError> {
        self.fail()
    }

    async fn call_records(&self) -> Result<Vec<CallRecord>, CallsError> {
        self.fail()
    }

    async fn refresh_presence(&self, _: &NodeId, _: Duration) -> Result<bool, CallsError> {
        self.fail()
    }

    async fn remove_presence(&self, _: &NodeId) -> Result<(), CallsError> {
        self.fail()
    }

    async fn live_nodes(&self) -> Result<Vec<NodeId>, CallsError> {
        self.fail()
    }

    async fn publish(&self, _: &NodeId, _: ClusterEventKind) -> Result<u64, CallsError> {
        self.fail()
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterEvent>, CallsError> {
        self.fail()
    }
}
