//! Conditional multi-operation transactions.
//!
//! A transaction evaluates every [`Compare`] against one revision; if all pass
//! the success operations run, otherwise the failure operations, and all of
//! them commit at a single new revision.

use super::types::KeyValue;
use serde::{Deserialize, Serialize};

/// Transaction request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnRequest {
    /// Compare predicates (all must pass for the success branch).
    pub compares: Vec<Compare>,
    /// Operations to execute if all compares succeed.
    pub success: Vec<TxnOp>,
    /// Operations to execute if any compare fails.
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    /// Unconditional transaction executing `ops`.
    pub fn then(ops: Vec<TxnOp>) -> Self {
        Self {
            compares: Vec::new(),
            success: ops,
            failure: Vec::new(),
        }
    }

    /// Conditional transaction executing `ops` when `compares` all hold.
    pub fn when(compares: Vec<Compare>, ops: Vec<TxnOp>) -> Self {
        Self {
            compares,
            success: ops,
            failure: Vec::new(),
        }
    }
}

/// Transaction response.
#[derive(Debug, Clone, Copy)]
pub struct TxnResponse {
    /// Whether all compares passed.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: i64,
}

/// Mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    /// Put a key, optionally bound to a lease.
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<i64>,
    },
    /// Delete a key, or the half-open range `[key, range_end)`.
    DeleteRange {
        key: Vec<u8>,
        range_end: Option<Vec<u8>>,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, lease: i64) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::DeleteRange {
            key: key.into(),
            range_end: None,
        }
    }

    pub fn delete_range(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self::DeleteRange {
            key: key.into(),
            range_end: Some(range_end.into()),
        }
    }
}

/// Compare predicate for transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub op: CompareOp,
}

/// Compared field, carrying the expected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(i64),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl Compare {
    pub fn new(key: impl Into<Vec<u8>>, op: CompareOp, target: CompareTarget) -> Self {
        Self {
            key: key.into(),
            target,
            op,
        }
    }

    /// Evaluate against the current record of `key` (`None` if absent).
    ///
    /// An absent key has version, revisions and lease 0 and an empty value.
    pub fn evaluate(&self, kv: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::Version(expected) => {
                compare_values(kv.map_or(0, |kv| kv.version), *expected, self.op)
            }
            CompareTarget::CreateRevision(expected) => {
                compare_values(kv.map_or(0, |kv| kv.create_revision), *expected, self.op)
            }
            CompareTarget::ModRevision(expected) => {
                compare_values(kv.map_or(0, |kv| kv.mod_revision), *expected, self.op)
            }
            CompareTarget::Lease(expected) => {
                compare_values(kv.map_or(0, |kv| kv.lease), *expected, self.op)
            }
            CompareTarget::Value(expected) => {
                let actual = kv.map_or(&[][..], |kv| kv.value.as_slice());
                compare_bytes(actual, expected, self.op)
            }
        }
    }
}

fn compare_values(actual: i64, expected: i64, op: CompareOp) -> bool {
    match op {
        CompareOp::Equal => actual == expected,
        CompareOp::NotEqual => actual != expected,
        CompareOp::Greater => actual > expected,
        CompareOp::Less => actual < expected,
    }
}

fn compare_bytes(actual: &[u8], expected: &[u8], op: CompareOp) -> bool {
    match op {
        CompareOp::Equal => actual == expected,
        CompareOp::NotEqual => actual != expected,
        CompareOp::Greater => actual > expected,
        CompareOp::Less => actual < expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: i64, value: &[u8]) -> KeyValue {
        KeyValue {
            key: b"k".to_vec(),
            value: value.to_vec(),
            create_revision: 3,
            mod_revision: 7,
            version,
            lease: 0,
        }
    }

    #[test]
    fn absent_key_has_version_zero() {
        let cmp = Compare::new("k", CompareOp::Equal, CompareTarget::Version(0));
        assert!(cmp.evaluate(None));
        assert!(!cmp.evaluate(Some(&record(1, b"v"))));
    }

    #[test]
    fn value_compare_is_lexicographic() {
        let kv = record(2, b"beta");
        let gt = Compare::new("k", CompareOp::Greater, CompareTarget::Value(b"alpha".to_vec()));
        let lt = Compare::new("k", CompareOp::Less, CompareTarget::Value(b"alpha".to_vec()));
        assert!(gt.evaluate(Some(&kv)));
        assert!(!lt.evaluate(Some(&kv)));
    }

    #[test]
    fn revision_compares_use_record_metadata() {
        let kv = record(2, b"v");
        assert!(Compare::new("k", CompareOp::Equal, CompareTarget::ModRevision(7)).evaluate(Some(&kv)));
        assert!(
            Compare::new("k", CompareOp::Less, CompareTarget::CreateRevision(4)).evaluate(Some(&kv))
        );
        assert!(Compare::new("k", CompareOp::Equal, CompareTarget::Lease(0)).evaluate(Some(&kv)));
    }
}
