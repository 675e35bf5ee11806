//! Recording job service that counts init attempts.

use async_trait::async_trait;
use calls_service::bootstrap::JobService;
use calls_service::errors::CallsError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Mock job service.
#[derive(Default)]
pub struct MockJobService {
    fail: AtomicBool,
    init_calls: AtomicUsize,
    called: Notify,
}

impl MockJobService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `init` fail with a job service error.
    #[must_use]
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Wait until `init` has been called at least once.
    pub async fn wait_for_init(&self) {
        loop {
            let notified = self.called.notified();
            if self.init_calls() > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl JobService for MockJobService {
    async fn init(&self) -> Result<(), CallsError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.called.notify_waiters();
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallsError::Jobs("job service unavailable".to_string()));
        }
        Ok(())
    }
}
