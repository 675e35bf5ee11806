//! Calls Service Library
//!
//! Cluster-aware coordination for real-time calls:
//!
//! - Named distributed locks over a shared coordination store
//! - One-time selection of the media backend (embedded engine or external daemon)
//! - Cluster-wide bot identity provisioning under a lock
//! - Stale call-state cleanup by the designated single handler
//! - Per-call node ownership with sequence-guarded broadcasts
//! - A signaling relay between client transports and the media backend
//! - A cluster event consumer that keeps node-local views current
//!
//! # Architecture
//!
//! ```text
//! CallsService (activation / deactivation)
//! ├── MediaBackendMode ── EmbeddedRtcServer | RtcdClientManager
//! ├── SignalingRelay
//! │   ├── inbound: client frame → owner node → backend
//! │   └── dispatcher → SessionWriter (one per local session) → ClientTransport
//! ├── ClusterEventHandler ── CoordinationStore::subscribe
//! ├── NodePresence (heartbeat + departed-node sweep)
//! └── bootstrap: BotIdentityProvisioner, ClusterStateReconciler (DistributedMutex)
//! ```
//!
//! # Modules
//!
//! - [`backend`] - Media backend trait, selector and implementations
//! - [`bootstrap`] - Bot identity provisioning, stale-state cleanup and the recording job service check
//! - [`cluster`] - Coordination store, distributed mutex, events, presence
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types and propagation classes
//! - [`ownership`] - Per-call node ownership
//! - [`relay`] - Signaling relay
//! - [`service`] - Activation and deactivation
//! - [`ws`] - Client WebSocket endpoint

#![warn(clippy::pedantic)]

pub mod backend;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod observability;
pub mod ownership;
pub mod relay;
pub mod service;
pub mod signaling;
pub mod transport;
pub mod ws;
