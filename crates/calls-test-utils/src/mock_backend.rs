//! Media backend driven by the test.
//!
//! Frames sent to the backend are recorded; the test pushes backend events
//! through [`MockBackend::emit`] and simulates a crash with
//! [`MockBackend::terminate`].

use async_trait::async_trait;
use calls_service::backend::MediaBackend;
use calls_service::errors::CallsError;
use calls_service::signaling::SignalingMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub struct MockBackend {
    received: Mutex<Vec<SignalingMessage>>,
    events_tx: Mutex<Option<mpsc::Sender<SignalingMessage>>>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    stopped: AtomicBool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            received: Mutex::new(Vec::new()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: tokio::sync::Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Push a backend event.
    ///
    /// # Panics
    ///
    /// Panics if the backend was terminated or the relay dropped the stream.
    pub async fn emit(&self, message: SignalingMessage) {
        let tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("backend already terminated");
        tx.send(message).await.expect("event stream closed");
    }

    /// Close the event stream, as a crashed backend would.
    pub fn terminate(&self) {
        self.events_tx.lock().unwrap().take();
    }

    pub fn received(&self) -> Vec<SignalingMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallsError> {
        if self.stopped.load(Ordering::SeqCst) || self.events_tx.lock().unwrap().is_none() {
            return Err(CallsError::BackendTerminated);
        }
        self.received.lock().unwrap().push(message);
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<SignalingMessage>> {
        self.events_rx.lock().await.take()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.terminate();
    }
}
