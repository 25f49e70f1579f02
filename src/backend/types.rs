//! Records, responses and stream types exchanged with a store backend.

use crate::core::error::KvResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// A key-value record as stored, with its MVCC metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key.
    pub key: Vec<u8>,
    /// Value.
    pub value: Vec<u8>,
    /// Revision when the key was created (0 means "not found").
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
    /// Number of writes since creation.
    pub version: i64,
    /// Attached lease ID, 0 if none.
    pub lease: i64,
}

/// Range (get) response.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Store revision the read was served at.
    pub revision: i64,
    /// Matching records in key order.
    pub kvs: Vec<KeyValue>,
}

/// Put response.
#[derive(Debug, Clone, Copy)]
pub struct PutResponse {
    /// Revision of the write.
    pub revision: i64,
}

/// Delete response.
#[derive(Debug, Clone, Copy)]
pub struct DeleteResponse {
    /// Store revision after the delete.
    pub revision: i64,
    /// Number of keys removed.
    pub deleted: i64,
}

/// Lease grant response.
#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    /// Assigned lease ID.
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
}

/// Watch event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted.
    Delete,
}

/// One change in a watch batch. For deletes `kv` carries the key and the
/// deletion revision only.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

/// Events committed at one store revision, in commit order.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// Live subscription to a backend change feed.
///
/// Dropping the stream tears down the underlying subscription.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<KvResult<WatchBatch>>,
    _guard: Option<DropGuard>,
}

impl WatchStream {
    /// Wrap a receiver. The guard, if any, is cancelled when the stream drops.
    pub fn new(rx: mpsc::UnboundedReceiver<KvResult<WatchBatch>>, guard: Option<DropGuard>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next batch, or `None` once the backend closed the feed.
    pub async fn next(&mut self) -> Option<KvResult<WatchBatch>> {
        self.rx.recv().await
    }
}

/// Cluster member as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

/// Member list response.
#[derive(Debug, Clone)]
pub struct MemberList {
    pub cluster_id: u64,
    pub member_id: u64,
    pub revision: i64,
    pub raft_term: u64,
    pub members: Vec<Member>,
}

/// Status reported by one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub version: String,
    pub db_size: i64,
    pub db_size_in_use: i64,
    /// Member ID of the leader as seen by this endpoint.
    pub leader: u64,
    pub raft_index: u64,
    pub raft_term: u64,
    pub raft_applied_index: u64,
    pub is_learner: bool,
}
