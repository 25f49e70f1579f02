//! Error types and retry classification.
//!
//! Every remote call surfaces a [`KvError`]. Callers decide what to do with it
//! through [`KvError::kind`], a small closed set of structured kinds, rather
//! than by inspecting driver-specific error values. Only
//! [`ErrorKind::Unavailable`] and [`ErrorKind::ProposalDropped`] are retried by
//! the retry governor.

use thiserror::Error;

/// Message the store attaches to a write lost in a leadership transition.
pub const PROPOSAL_DROPPED_MESSAGE: &str = "raft proposal dropped";

/// Common client error conditions.
#[derive(Debug, Error)]
pub enum KvError {
    /// The store (or the member serving the call) is temporarily unavailable.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// A write was dropped by the consensus layer during a leadership change.
    #[error("raft proposal dropped")]
    ProposalDropped,

    /// A single remote call exceeded its per-call timeout.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    /// A lock could not be acquired before the caller's deadline.
    #[error("could not acquire lock on key {key} before deadline")]
    LockDeadlineExceeded { key: String },

    /// A key the operation depends on does not exist.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// A lease referenced by the operation does not exist (expired or revoked).
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// A transaction executed but its conditions did not hold.
    #[error("transaction failed: {context}")]
    TxnFailed { context: String },

    /// The requested revision has been compacted away.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    RevisionCompacted {
        revision: i64,
        compaction_floor: i64,
    },

    /// A chunk that must exist at a pinned revision is missing.
    #[error("{key} chunk key not found at revision {revision}")]
    ChunkMissing { key: String, revision: i64 },

    /// A watch stream ended before the caller's condition was met.
    #[error("watch stopped: {message}")]
    WatchStopped { message: String },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Diff batch framing violated the transfer contract.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// A cluster topology precondition did not hold (leader transfer).
    #[error("cluster: {message}")]
    Cluster { message: String },

    /// Invalid request arguments.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Payload (chunk info, lock) could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Local I/O failure while streaming a chunked value.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure. Fatal.
    #[error("backend error: {message}")]
    Backend { message: String },
}

/// Diff batch framing contract violations.
///
/// These tell callers "the usage was wrong" apart from "the backend failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("first key diff frame was not an overview")]
    FirstFrameNotOverview,
    #[error("key diff frame after the first was not a changes frame")]
    FrameNotChanges,
    #[error("number of operations in key diff frames did not match overview")]
    OpsMiscount,
    #[error("change type for one of the changes was not valid")]
    InvalidChangeType,
}

/// Closed classification of [`KvError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unavailable,
    ProposalDropped,
    NotFound,
    PreconditionFailed,
    Cancelled,
    DeadlineExceeded,
    Consistency,
    Contract,
    Invalid,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "Unavailable"),
            Self::ProposalDropped => write!(f, "ProposalDropped"),
            Self::NotFound => write!(f, "NotFound"),
            Self::PreconditionFailed => write!(f, "PreconditionFailed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            Self::Consistency => write!(f, "Consistency"),
            Self::Contract => write!(f, "Contract"),
            Self::Invalid => write!(f, "Invalid"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}

impl KvError {
    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a Backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a KeyNotFound error.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Create a TxnFailed error.
    pub fn txn_failed(context: impl Into<String>) -> Self {
        Self::TxnFailed {
            context: context.into(),
        }
    }

    /// Create a Cluster error.
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::ProposalDropped => ErrorKind::ProposalDropped,
            Self::RequestTimeout { .. } | Self::LockDeadlineExceeded { .. } => {
                ErrorKind::DeadlineExceeded
            }
            Self::KeyNotFound { .. } | Self::LeaseNotFound { .. } => ErrorKind::NotFound,
            Self::TxnFailed { .. } | Self::Cluster { .. } => ErrorKind::PreconditionFailed,
            Self::RevisionCompacted { .. } | Self::ChunkMissing { .. } => ErrorKind::Consistency,
            Self::WatchStopped { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Contract(_) => ErrorKind::Contract,
            Self::InvalidRequest { .. } => ErrorKind::Invalid,
            Self::Codec(_) | Self::Io(_) | Self::Backend { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is transient and the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Unavailable | ErrorKind::ProposalDropped
        )
    }

    /// Check if this error is a diff framing contract violation.
    pub fn is_api_contract_error(&self) -> bool {
        matches!(self, Self::Contract(_))
    }

    /// Check if this error is a lock acquisition deadline (contention, not a
    /// backend failure).
    pub fn is_lock_deadline(&self) -> bool {
        matches!(self, Self::LockDeadlineExceeded { .. })
    }
}

/// Result type using KvError.
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_and_dropped_proposals_retry() {
        assert!(KvError::unavailable("leader lost").is_retriable());
        assert!(KvError::ProposalDropped.is_retriable());
        assert!(!KvError::RequestTimeout { timeout_ms: 10 }.is_retriable());
        assert!(!KvError::key_not_found("a").is_retriable());
        assert!(!KvError::txn_failed("cas").is_retriable());
        assert!(!KvError::Cancelled.is_retriable());
        assert!(!KvError::backend("boom").is_retriable());
    }

    #[test]
    fn chunk_missing_is_a_consistency_error() {
        let err = KvError::ChunkMissing {
            key: "big/chunks/v2/3".to_string(),
            revision: 14,
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(
            err.to_string(),
            "big/chunks/v2/3 chunk key not found at revision 14"
        );
    }

    #[test]
    fn contract_errors_are_distinguished() {
        let err: KvError = ContractError::OpsMiscount.into();
        assert!(err.is_api_contract_error());
        assert_eq!(err.kind(), ErrorKind::Contract);
        assert!(!KvError::backend("x").is_api_contract_error());
    }

    #[test]
    fn lock_deadline_is_distinguishable_from_backend_errors() {
        let err = KvError::LockDeadlineExceeded {
            key: "/locks/a".to_string(),
        };
        assert!(err.is_lock_deadline());
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(!KvError::unavailable("x").is_lock_deadline());
    }
}
