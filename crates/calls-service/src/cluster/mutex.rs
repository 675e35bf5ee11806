//! Cluster-wide named mutex.
//!
//! `lock(name, timeout)` polls the coordination store with exponential backoff
//! until the lock is taken or the timeout elapses. A held lock carries a lease
//! that a background task renews at half the lease period; if the holder dies
//! without unlocking, the lease expires and any node may take the lock.
//!
//! A store error fails the acquisition immediately with
//! `CallsError::CoordinationUnavailable` instead of polling until timeout.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mutex = DistributedMutex::new(store, node_id, MutexConfig::with_lease(lease));
//!
//! // Released on both the Ok and Err paths
//! mutex
//!     .run_locked("ensure_bot", timeout, || async { provision().await })
//!     .await?;
//! ```

use crate::cluster::store::CoordinationStore;
use crate::errors::CallsError;
use crate::observability::metrics;
use common::types::NodeId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// First retry delay after a contended attempt.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(25);

/// Cap on the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Lease and polling settings. The lease is fixed for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct MutexConfig {
    pub lease: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl MutexConfig {
    #[must_use]
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Named distributed lock factory bound to one node.
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    node_id: NodeId,
    config: MutexConfig,
}

impl DistributedMutex {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, node_id: NodeId, config: MutexConfig) -> Self {
        Self {
            store,
            node_id,
            config,
        }
    }

    /// Acquire `name`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `CallsError::LockTimeout` if another holder kept the lock past `timeout`
    /// - `CallsError::CoordinationUnavailable` if the store could not be reached
    #[instrument(skip_all, name = "calls.cluster.mutex.lock", fields(lock = %name))]
    pub async fn lock(&self, name: &str, timeout: Duration) -> Result<MutexGuard, CallsError> {
        // Unique per acquisition so a stale guard can never release a newer hold
        let holder = format!("{}:{}", self.node_id, uuid::Uuid::new_v4());
        let started = Instant::now();
        let deadline = started + timeout;
        let mut backoff = self.config.min_backoff;

        loop {
            match self.store.try_lock(name, &holder, self.config.lease).await {
                Ok(true) => {
                    metrics::record_mutex_acquisition(name, "acquired", started.elapsed());
                    debug!(
                        target: "calls.cluster.mutex",
                        lock = %name,
                        waited_ms = started.elapsed().as_millis(),
                        "Cluster lock acquired"
                    );
                    return Ok(MutexGuard::start(
                        Arc::clone(&self.store),
                        name.to_string(),
                        holder,
                        self.config.lease,
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    metrics::record_mutex_acquisition(name, "unavailable", started.elapsed());
                    warn!(
                        target: "calls.cluster.mutex",
                        lock = %name,
                        error = %e,
                        "Coordination store unavailable while acquiring lock"
                    );
                    return Err(match e {
                        CallsError::CoordinationUnavailable(_) => e,
                        other => CallsError::CoordinationUnavailable(other.to_string()),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::record_mutex_acquisition(name, "timeout", started.elapsed());
                warn!(
                    target: "calls.cluster.mutex",
                    lock = %name,
                    timeout_ms = timeout.as_millis(),
                    "Timed out acquiring cluster lock"
                );
                return Err(CallsError::LockTimeout {
                    name: name.to_string(),
                });
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Run `f` while holding `name`. The lock is released whether `f`
    /// succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error, or the error produced by `f`.
    pub async fn run_locked<F, Fut, T>(
        &self,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, CallsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallsError>>,
    {
        let guard = self.lock(name, timeout).await?;
        let result = f().await;
        if let Err(e) = guard.unlock().await {
            // Lease expiry releases it eventually
            warn!(
                target: "calls.cluster.mutex",
                lock = %name,
                error = %e,
                "Failed to release cluster lock"
            );
        }
        result
    }
}

/// A held cluster lock.
///
/// Prefer [`MutexGuard::unlock`]; dropping the guard releases the lock from a
/// spawned task on a best-effort basis.
pub struct MutexGuard {
    store: Arc<dyn CoordinationStore>,
    name: String,
    holder: String,
    renew_token: CancellationToken,
    released: bool,
}

impl MutexGuard {
    fn start(
        store: Arc<dyn CoordinationStore>,
        name: String,
        holder: String,
        lease: Duration,
    ) -> Self {
        let renew_token = CancellationToken::new();
        tokio::spawn(renew_lease(
            Arc::clone(&store),
            name.clone(),
            holder.clone(),
            lease,
            renew_token.clone(),
        ));
        Self {
            store,
            name,
            holder,
            renew_token,
            released: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock now, regardless of remaining lease.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::CoordinationUnavailable` if the store could not be
    /// reached; the lease then expires on its own.
    pub async fn unlock(mut self) -> Result<(), CallsError> {
        self.released = true;
        self.renew_token.cancel();
        let held = self.store.unlock(&self.name, &self.holder).await?;
        if held {
            debug!(target: "calls.cluster.mutex", lock = %self.name, "Cluster lock released");
        } else {
            warn!(
                target: "calls.cluster.mutex",
                lock = %self.name,
                "Cluster lock lease had already expired at release"
            );
        }
        Ok(())
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.renew_token.cancel();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let name = std::mem::take(&mut self.name);
            let holder = std::mem::take(&mut self.holder);
            handle.spawn(async move {
                if let Err(e) = store.unlock(&name, &holder).await {
                    warn!(target: "calls.cluster.mutex", lock = %name, error = %e, "Drop release failed");
                }
            });
        }
    }
}

async fn renew_lease(
    store: Arc<dyn CoordinationStore>,
    name: String,
    holder: String,
    lease: Duration,
    cancel_token: CancellationToken,
) {
    let period = (lease / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                match store.renew_lock(&name, &holder, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        metrics::record_mutex_lease_lost(&name);
                        warn!(
                            target: "calls.cluster.mutex",
                            lock = %name,
                            "Cluster lock lease lost before release"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            target: "calls.cluster.mutex",
                            lock = %name,
                            error = %e,
                            "Failed to renew cluster lock lease, will retry"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCoordinationStore;

    const LEASE: Duration = Duration::from_secs(10);

    fn mutex_for(store: &Arc<MemoryCoordinationStore>, node: &str) -> DistributedMutex {
        DistributedMutex::new(
            Arc::clone(store) as Arc<dyn CoordinationStore>,
            NodeId::from(node),
            MutexConfig::with_lease(LEASE),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_times_out() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = mutex_for(&store, "node-a");
        let b = mutex_for(&store, "node-b");

        let _held = a.lock("ensure_bot", Duration::from_secs(1)).await.unwrap();
        let result = b.lock("ensure_bot", Duration::from_secs(2)).await;

        assert!(matches!(result, Err(CallsError::LockTimeout { name }) if name == "ensure_bot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_survives_past_lease_via_renewal() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = mutex_for(&store, "node-a");
        let b = mutex_for(&store, "node-b");

        let guard = a.lock("cleanup_state", Duration::from_secs(1)).await.unwrap();

        // Three lease periods later the renew task has kept it alive
        tokio::time::sleep(LEASE * 3).await;
        assert!(b.lock("cleanup_state", Duration::ZERO).await.is_err());

        guard.unlock().await.unwrap();
        assert!(b.lock("cleanup_state", Duration::ZERO).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_locked_releases_on_error() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = mutex_for(&store, "node-a");

        let result: Result<(), CallsError> = a
            .run_locked("cleanup_state", Duration::from_secs(1), || async {
                Err(CallsError::Internal("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(CallsError::Internal(_))));

        // Immediately acquirable again
        let guard = a.lock("cleanup_state", Duration::ZERO).await.unwrap();
        assert_eq!(guard.name(), "cleanup_state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_is_released() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = mutex_for(&store, "node-a");
        let b = mutex_for(&store, "node-b");

        drop(a.lock("ensure_bot", Duration::ZERO).await.unwrap());

        let acquired = b.lock("ensure_bot", Duration::from_secs(1)).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_names_do_not_contend() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = mutex_for(&store, "node-a");

        let _bot = a.lock("ensure_bot", Duration::ZERO).await.unwrap();
        assert!(a.lock("cleanup_state", Duration::ZERO).await.is_ok());
    }
}
