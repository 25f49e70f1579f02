//! Transaction condition helpers.
//!
//! Used as extra conditions for lock acquisition, or directly in
//! [`TxnRequest`](crate::backend::TxnRequest)s.

use crate::backend::{Compare, CompareOp, CompareTarget};

/// Holds when `key` exists (`present == true`) or is absent (`false`).
pub fn key_present(key: &str, present: bool) -> Compare {
    if present {
        Compare::new(key, CompareOp::Greater, CompareTarget::Version(0))
    } else {
        Compare::new(key, CompareOp::Equal, CompareTarget::Version(0))
    }
}

/// Holds when the value of `key` compares to `value` with `op`.
pub fn value_cmp(key: &str, op: CompareOp, value: impl Into<Vec<u8>>) -> Compare {
    Compare::new(key, op, CompareTarget::Value(value.into()))
}

/// Holds when the version of `key` compares to `version` with `op`.
pub fn version_cmp(key: &str, op: CompareOp, version: i64) -> Compare {
    Compare::new(key, op, CompareTarget::Version(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyValue;

    #[test]
    fn presence_checks_version() {
        let kv = KeyValue {
            key: b"/flag".to_vec(),
            value: b"on".to_vec(),
            create_revision: 2,
            mod_revision: 2,
            version: 1,
            lease: 0,
        };
        assert!(key_present("/flag", true).evaluate(Some(&kv)));
        assert!(!key_present("/flag", true).evaluate(None));
        assert!(key_present("/flag", false).evaluate(None));
        assert!(!key_present("/flag", false).evaluate(Some(&kv)));
        assert!(value_cmp("/flag", CompareOp::Equal, "on").evaluate(Some(&kv)));
        assert!(version_cmp("/flag", CompareOp::Less, 2).evaluate(Some(&kv)));
    }
}
