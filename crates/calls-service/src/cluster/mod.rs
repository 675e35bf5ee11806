//! Cluster coordination.
//!
//! The coordination store is the only state shared between nodes. On top of it
//! this module provides the named [`DistributedMutex`], the event consumer that
//! keeps node-local views current, and node presence.

pub mod events;
pub mod lua_scripts;
pub mod memory;
pub mod mutex;
pub mod presence;
pub mod redis_store;
pub mod store;

pub use events::ClusterEventHandler;
pub use memory::MemoryCoordinationStore;
pub use mutex::{DistributedMutex, MutexConfig, MutexGuard};
pub use presence::{start_presence_heartbeat, NodePresence};
pub use redis_store::RedisCoordinationStore;
pub use store::{
    CallRecord, ClaimOutcome, ClusterEvent, ClusterEventKind, CoordinationStore, ReleaseOutcome,
};
