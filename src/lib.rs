//! etcdkit - retry-governed convenience client for etcd v3 style stores.
//!
//! etcdkit layers failure-tolerant, size-unbounded operations on top of a
//! linearizable, versioned, lease-capable key-value store: chunked values,
//! keyspace diffs applied in one transaction, lease-backed locks and
//! watch-driven group membership. Every remote call goes through one retry
//! governor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Chunked keys   │   Locks   │   Groups   │   Cluster ops       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Client                                │
//! │   Keys │ Ranges/Prefixes │ Watch │ Diff engine │ Conditions     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Retry governor                            │
//! │        per-call timeout │ fixed interval │ bounded budget       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        KvBackend                                │
//! │         MemoryBackend (MVCC, in-process) │ EtcdBackend          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types and retry classification
//! - [`core::retry`] - Retry governor
//! - [`core::telemetry`] - Tracing setup
//!
//! ## Store
//! - [`backend`] - Backend trait, transactions, in-memory store, etcd adapter
//!
//! ## Client
//! - [`client`] - Key, range, watch, diff and cluster operations
//! - [`diff`] - Keyspace diff engine and transport framing
//! - [`chunked`] - Chunked key store
//! - [`lock`] - Distributed lock
//! - [`group`] - Group membership and threshold waits
//!
//! # Key Invariants
//!
//! - Only `Unavailable` and `ProposalDropped` errors are retried
//! - A diff applies at a single store revision or not at all
//! - A chunked key reader never mixes bytes from two versions
//! - At most one holder owns a lock key at a time

// Core infrastructure
pub mod core;

// Store seam
pub mod backend;

// Client operations
pub mod client;
pub mod diff;

// Higher-level primitives
pub mod chunked;
pub mod group;
pub mod lock;

// Re-exports for convenience
pub use self::core::config::ClientConfig;
pub use self::core::error::{ContractError, ErrorKind, KvError, KvResult};
pub use self::core::retry::RetryPolicy;
pub use chunked::{ChunkedKeyInfo, ChunksReader};
pub use client::{Client, KeyInfo, KeyInfoMap, KeyRangeInfo, WatchInfo, WatchOptions};
pub use diff::{compute_diff, KeyDiff, ValueMap};
pub use group::{GroupMembers, ThresholdWait, WaitOutcome};
pub use lock::{AcquireLockOptions, Lock};
