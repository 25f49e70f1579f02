//! Keyspace diffs.
//!
//! A [`KeyDiff`] lists the changes that turn a destination keyspace into a
//! source keyspace:
//! - keys only in the source are inserts
//! - keys in both with differing values are updates
//! - keys only in the destination are deletions
//!
//! Equal values produce no entry. Diffs are plain values: the filtering and
//! remapping helpers return new diffs and leave the input untouched.
//!
//! [`framing`] splits diffs into size-bounded frames for transport.

pub mod framing;

use crate::backend::TxnOp;
use crate::client::KeyInfoMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Flat key/value snapshot of a keyspace.
pub type ValueMap = BTreeMap<String, Vec<u8>>;

/// Changes turning a destination keyspace into a source keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDiff {
    /// Keys to create, with their source value.
    pub inserts: BTreeMap<String, Vec<u8>>,
    /// Keys to overwrite, with their source value.
    pub updates: BTreeMap<String, Vec<u8>>,
    /// Keys to remove.
    pub deletions: BTreeSet<String>,
}

/// Compute the diff that turns `dst` into `src`.
pub fn compute_diff(src: &ValueMap, dst: &ValueMap) -> KeyDiff {
    let mut diff = KeyDiff::default();
    for key in dst.keys() {
        if !src.contains_key(key) {
            diff.deletions.insert(key.clone());
        }
    }
    for (key, value) in src {
        match dst.get(key) {
            None => {
                diff.inserts.insert(key.clone(), value.clone());
            }
            Some(current) if current != value => {
                diff.updates.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    diff
}

impl KeyDiff {
    /// Diff between two range reads, each keyed relative to its own prefix.
    pub fn from_key_maps(
        src: &KeyInfoMap,
        src_prefix: &str,
        dst: &KeyInfoMap,
        dst_prefix: &str,
    ) -> Self {
        compute_diff(&src.to_value_map(src_prefix), &dst.to_value_map(dst_prefix))
    }

    /// Whether applying this diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }

    /// Number of operations carried.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletions.len()
    }

    /// Inserts followed by updates.
    pub fn upserts(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.inserts.iter().chain(self.updates.iter())
    }

    /// Apply to a local snapshot. Applying the same diff again is a no-op.
    pub fn apply_to(&self, values: &mut ValueMap) {
        for key in &self.deletions {
            values.remove(key);
        }
        for (key, value) in self.upserts() {
            values.insert(key.clone(), value.clone());
        }
    }

    /// Keep only the changes whose key satisfies `keep`.
    pub fn filter_keys(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            inserts: filter_map(&self.inserts, &keep),
            updates: filter_map(&self.updates, &keep),
            deletions: self
                .deletions
                .iter()
                .filter(|key| keep(key))
                .cloned()
                .collect(),
        }
    }

    /// Rewrite every key with `transform`.
    pub fn map_keys(&self, transform: impl Fn(&str) -> String) -> Self {
        Self {
            inserts: remap(&self.inserts, &transform),
            updates: remap(&self.updates, &transform),
            deletions: self.deletions.iter().map(|key| transform(key)).collect(),
        }
    }

    /// Store operations applying this diff under `prefix`: deletions first,
    /// then puts.
    pub fn to_ops(&self, prefix: &str) -> Vec<TxnOp> {
        let deletes = self
            .deletions
            .iter()
            .map(|key| TxnOp::delete(format!("{}{}", prefix, key)));
        let puts = self
            .upserts()
            .map(|(key, value)| TxnOp::put(format!("{}{}", prefix, key), value.clone()));
        deletes.chain(puts).collect()
    }
}

fn filter_map(
    map: &BTreeMap<String, Vec<u8>>,
    keep: &impl Fn(&str) -> bool,
) -> BTreeMap<String, Vec<u8>> {
    map.iter()
        .filter(|(key, _)| keep(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn remap(
    map: &BTreeMap<String, Vec<u8>>,
    transform: &impl Fn(&str) -> String,
) -> BTreeMap<String, Vec<u8>> {
    map.iter()
        .map(|(key, value)| (transform(key), value.clone()))
        .collect()
}
