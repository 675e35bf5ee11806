//! Redis-backed coordination store.
//!
//! # Key Patterns
//!
//! - `calls:lock:{name}` - Named lock, value is the holder identity, `PX` lease
//! - `calls:call:{id}` - Ownership record (HASH: owner, seq, created_at)
//! - `calls:calls` - Index of call ids with a record (SET)
//! - `calls:node:{id}` - Node presence, `PX` lease
//! - `calls:nodes` - Index of nodes that ever heartbeated (SET)
//! - `calls:seq` - Cluster event sequence counter
//! - `calls:events` - Pub/sub channel carrying [`ClusterEvent`] JSON
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
//! every operation clones it instead of sharing it behind a lock. Pub/sub needs
//! a dedicated connection, which [`RedisCoordinationStore::subscribe`] opens on
//! demand.

use crate::cluster::lua_scripts;
use crate::cluster::store::{
    CallRecord, ClaimOutcome, ClusterEvent, ClusterEventKind, CoordinationStore, ReleaseOutcome,
    SUBSCRIBER_BUFFER,
};
use crate::errors::CallsError;
use async_trait::async_trait;
use common::types::{CallId, NodeId};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

const LOCK_PREFIX: &str = "calls:lock:";
const CALL_PREFIX: &str = "calls:call:";
const CALL_INDEX: &str = "calls:calls";
const NODE_PREFIX: &str = "calls:node:";
const NODE_INDEX: &str = "calls:nodes";
const SEQ_KEY: &str = "calls:seq";
const EVENT_CHANNEL: &str = "calls:events";

/// Event body published through `PUBLISH_EVENT`; the script adds `seq`.
#[derive(Serialize)]
struct UnsequencedEvent<'a> {
    origin: &'a NodeId,
    #[serde(flatten)]
    kind: &'a ClusterEventKind,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Coordination store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    /// Kept for opening pub/sub connections.
    client: Client,
    connection: MultiplexedConnection,
    unlock_script: Script,
    renew_script: Script,
    claim_script: Script,
    release_script: Script,
    evict_script: Script,
    publish_script: Script,
    presence_script: Script,
    live_nodes_script: Script,
}

impl RedisCoordinationStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CallsError::CoordinationUnavailable` if the URL is invalid or
    /// the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CallsError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log the URL, it may carry a password
            error!(
                target: "calls.cluster.redis",
                error = %e,
                "Failed to open Redis client"
            );
            CallsError::CoordinationUnavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "calls.cluster.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CallsError::CoordinationUnavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            unlock_script: Script::new(lua_scripts::UNLOCK_IF_HOLDER),
            renew_script: Script::new(lua_scripts::RENEW_IF_HOLDER),
            claim_script: Script::new(lua_scripts::CLAIM_CALL),
            release_script: Script::new(lua_scripts::RELEASE_CALL),
            evict_script: Script::new(lua_scripts::EVICT_CALL),
            publish_script: Script::new(lua_scripts::PUBLISH_EVENT),
            presence_script: Script::new(lua_scripts::REFRESH_PRESENCE),
            live_nodes_script: Script::new(lua_scripts::LIVE_NODES),
        })
    }

    fn unavailable(op: &'static str) -> impl FnOnce(redis::RedisError) -> CallsError {
        move |e| {
            warn!(
                target: "calls.cluster.redis",
                error = %e,
                operation = op,
                "Redis operation failed"
            );
            CallsError::CoordinationUnavailable(format!("{op} failed: {e}"))
        }
    }

    fn parse_seq(raw: &str) -> Result<u64, CallsError> {
        raw.parse()
            .map_err(|_| CallsError::Internal(format!("Invalid sequence from store: {raw}")))
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip_all, fields(lock = %name))]
    async fn try_lock(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, CallsError> {
        let mut conn = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(format!("{LOCK_PREFIX}{name}"))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query_async(&mut conn)
            .await
            .map_err(Self::unavailable("try_lock"))?;
        Ok(acquired.is_some())
    }

    #[instrument(skip_all, fields(lock = %name))]
    async fn renew_lock(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, CallsError> {
        let mut conn = self.connection.clone();
        let renewed: i64 = self
            .renew_script
            .key(format!("{LOCK_PREFIX}{name}"))
            .arg(holder)
            .arg(millis(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("renew_lock"))?;
        Ok(renewed == 1)
    }

    #[instrument(skip_all, fields(lock = %name))]
    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, CallsError> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .unlock_script
            .key(format!("{LOCK_PREFIX}{name}"))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("unlock"))?;
        Ok(released == 1)
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn claim_call(
        &self,
        call_id: &CallId,
        node: &NodeId,
    ) -> Result<ClaimOutcome, CallsError> {
        let mut conn = self.connection.clone();
        let (status, value): (i64, String) = self
            .claim_script
            .key(format!("{CALL_PREFIX}{call_id}"))
            .key(CALL_INDEX)
            .key(SEQ_KEY)
            .arg(node.as_str())
            .arg(call_id.as_str())
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(EVENT_CHANNEL)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("claim_call"))?;

        if status == 1 {
            Ok(ClaimOutcome::Claimed {
                seq: Self::parse_seq(&value)?,
            })
        } else {
            Ok(ClaimOutcome::Conflict {
                owner: NodeId::from(value),
            })
        }
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn release_call(
        &self,
        call_id: &CallId,
        node: &NodeId,
    ) -> Result<ReleaseOutcome, CallsError> {
        let mut conn = self.connection.clone();
        let (status, value): (i64, String) = self
            .release_script
            .key(format!("{CALL_PREFIX}{call_id}"))
            .key(CALL_INDEX)
            .key(SEQ_KEY)
            .arg(node.as_str())
            .arg(call_id.as_str())
            .arg(EVENT_CHANNEL)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("release_call"))?;

        match status {
            1 => Ok(ReleaseOutcome::Released {
                seq: Self::parse_seq(&value)?,
            }),
            0 => Ok(ReleaseOutcome::Absent),
            _ => Ok(ReleaseOutcome::NotOwner {
                owner: NodeId::from(value),
            }),
        }
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn evict_call(
        &self,
        call_id: &CallId,
        origin: &NodeId,
    ) -> Result<Option<u64>, CallsError> {
        let mut conn = self.connection.clone();
        let (status, value): (i64, String) = self
            .evict_script
            .key(format!("{CALL_PREFIX}{call_id}"))
            .key(CALL_INDEX)
            .key(SEQ_KEY)
            .arg(origin.as_str())
            .arg(call_id.as_str())
            .arg(EVENT_CHANNEL)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("evict_call"))?;

        if status == 1 {
            Ok(Some(Self::parse_seq(&value)?))
        } else {
            Ok(None)
        }
    }

    async fn call_records(&self) -> Result<Vec<CallRecord>, CallsError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .smembers(CALL_INDEX)
            .await
            .map_err(Self::unavailable("call_records"))?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn
                .hgetall(format!("{CALL_PREFIX}{id}"))
                .await
                .map_err(Self::unavailable("call_records"))?;

            // Index entries can briefly outlive their record
            let Some(owner) = fields.get("owner") else {
                continue;
            };
            records.push(CallRecord {
                call_id: CallId::from(id.as_str()),
                owner: NodeId::from(owner.as_str()),
                seq: fields
                    .get("seq")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                created_at_ms: fields
                    .get("created_at")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }
        Ok(records)
    }

    async fn refresh_presence(&self, node: &NodeId, ttl: Duration) -> Result<bool, CallsError> {
        let mut conn = self.connection.clone();
        let joined: i64 = self
            .presence_script
            .key(format!("{NODE_PREFIX}{node}"))
            .key(NODE_INDEX)
            .arg(node.as_str())
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("refresh_presence"))?;
        Ok(joined == 1)
    }

    async fn remove_presence(&self, node: &NodeId) -> Result<(), CallsError> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .del(format!("{NODE_PREFIX}{node}"))
            .ignore()
            .srem(NODE_INDEX, node.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::unavailable("remove_presence"))?;
        Ok(())
    }

    async fn live_nodes(&self) -> Result<Vec<NodeId>, CallsError> {
        let mut conn = self.connection.clone();
        let nodes: Vec<String> = self
            .live_nodes_script
            .key(NODE_INDEX)
            .arg(NODE_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("live_nodes"))?;
        Ok(nodes.into_iter().map(NodeId::from).collect())
    }

    #[instrument(skip_all, fields(event = kind.as_label()))]
    async fn publish(&self, origin: &NodeId, kind: ClusterEventKind) -> Result<u64, CallsError> {
        let body = serde_json::to_string(&UnsequencedEvent {
            origin,
            kind: &kind,
        })
        .map_err(|e| CallsError::Internal(format!("Failed to encode cluster event: {e}")))?;

        let mut conn = self.connection.clone();
        let seq: u64 = self
            .publish_script
            .key(SEQ_KEY)
            .arg(EVENT_CHANNEL)
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable("publish"))?;

        debug!(
            target: "calls.cluster.redis",
            seq = seq,
            event = kind.as_label(),
            "Published cluster event"
        );
        Ok(seq)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterEvent>, CallsError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(Self::unavailable("subscribe"))?;
        pubsub
            .subscribe(EVENT_CHANNEL)
            .await
            .map_err(Self::unavailable("subscribe"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(target: "calls.cluster.redis", error = %e, "Unreadable pub/sub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<ClusterEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "calls.cluster.redis", error = %e, "Malformed cluster event");
                    }
                }
            }
            debug!(target: "calls.cluster.redis", "Cluster event subscription ended");
        });

        Ok(rx)
    }
}
