//! Store backend seam.
//!
//! [`KvBackend`] is the capability set the client consumes from the
//! underlying store: versioned reads (optionally at a past revision), writes,
//! range deletes, conditional transactions, change feeds, leases and the
//! cluster calls used by leadership maintenance. Every response carries the
//! store revision.
//!
//! # Backends
//!
//! | Backend | Use case |
//! |---------|----------|
//! | [`memory::MemoryBackend`] | Tests, embedding, fault injection |
//! | `etcd::EtcdBackend` (feature `etcd`) | Production etcd v3 clusters |
//!
//! # Ranges
//!
//! Ranges follow etcd conventions: `range_end = None` addresses the single
//! key, `Some(end)` the half-open interval `[key, end)`, and `Some([0])` every
//! key at or after `key`.

pub mod memory;
pub mod txn;
pub mod types;

#[cfg(feature = "etcd")]
pub mod etcd;

use crate::core::error::KvResult;
use async_trait::async_trait;

pub use txn::{Compare, CompareOp, CompareTarget, TxnOp, TxnRequest, TxnResponse};
pub use types::{
    DeleteResponse, EndpointStatus, EventType, KeyValue, LeaseGrant, Member, MemberList,
    PutResponse, RangeResponse, WatchBatch, WatchEvent, WatchStream,
};

/// Operations exposed by a linearizable, versioned, lease-capable store.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a key or range, at the latest revision or at `revision`.
    async fn range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        revision: Option<i64>,
    ) -> KvResult<RangeResponse>;

    /// Unconditional upsert, optionally bound to a lease.
    async fn put(&self, key: &[u8], value: &[u8], lease: Option<i64>) -> KvResult<PutResponse>;

    /// Delete a key or range.
    async fn delete_range(&self, key: &[u8], range_end: Option<&[u8]>)
        -> KvResult<DeleteResponse>;

    /// All-or-nothing conditional commit.
    async fn txn(&self, request: TxnRequest) -> KvResult<TxnResponse>;

    /// Subscribe to changes of a key or range, replaying from `start_revision`
    /// when given.
    async fn watch(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        start_revision: Option<i64>,
    ) -> KvResult<WatchStream>;

    /// Create a lease with `ttl` seconds.
    async fn lease_grant(&self, ttl: i64) -> KvResult<LeaseGrant>;

    /// Revoke a lease, deleting every key bound to it.
    async fn lease_revoke(&self, lease_id: i64) -> KvResult<()>;

    /// List cluster members.
    async fn member_list(&self) -> KvResult<MemberList>;

    /// Probe the status of one member endpoint.
    async fn endpoint_status(&self, endpoint: &str) -> KvResult<EndpointStatus>;

    /// Transfer leadership to `member_id`.
    async fn move_leader(&self, member_id: u64) -> KvResult<()>;
}

/// Lexicographic successor of `prefix`, usable as a range end addressing
/// every key that starts with `prefix`.
///
/// An empty prefix (or one made only of `0xff` bytes) maps to `[0]`, the
/// "every key from here on" marker.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Whether `key` falls inside the addressed key or range.
pub fn key_in_range(key: &[u8], start: &[u8], range_end: Option<&[u8]>) -> bool {
    match range_end {
        None => key == start,
        Some([0]) => key >= start,
        Some(end) => key >= start && key < end,
    }
}
