//! Keyspace diffs against the store.
//!
//! Both sides of a diff are snapshots taken by separate reads, possibly at
//! different revisions; callers must tolerate a stale diff.

use super::{Client, KeyInfoMap};
use crate::backend::TxnRequest;
use crate::core::error::{KvError, KvResult};
use crate::diff::KeyDiff;

impl Client {
    /// Diff turning the keys under `dst_prefix` into those under `src_prefix`,
    /// with prefix-relative keys.
    pub async fn diff_between_prefixes(&self, src_prefix: &str, dst_prefix: &str) -> KvResult<KeyDiff> {
        let src = self.get_prefix(src_prefix).await?;
        let dst = self.get_prefix(dst_prefix).await?;
        Ok(KeyDiff::from_key_maps(&src.keys, src_prefix, &dst.keys, dst_prefix))
    }

    /// Diff between the keys under `prefix` and a caller-supplied map whose
    /// keys carry `map_prefix`. With `input_is_source` the store side is
    /// the destination.
    pub async fn diff_prefix_with_map(
        &self,
        prefix: &str,
        input: &KeyInfoMap,
        map_prefix: &str,
        input_is_source: bool,
    ) -> KvResult<KeyDiff> {
        let stored = self.get_prefix(prefix).await?;
        Ok(if input_is_source {
            KeyDiff::from_key_maps(input, map_prefix, &stored.keys, prefix)
        } else {
            KeyDiff::from_key_maps(&stored.keys, prefix, input, map_prefix)
        })
    }

    /// Apply `diff` under `prefix` as one transaction: every change commits at
    /// a single revision, or none does. An empty diff issues no call.
    pub async fn apply_diff_to_prefix(&self, prefix: &str, diff: &KeyDiff) -> KvResult<()> {
        if diff.is_empty() {
            return Ok(());
        }
        let ops = diff.to_ops(prefix);
        let resp = self
            .call("apply_diff", |store| store.txn(TxnRequest::then(ops.clone())))
            .await?;
        if !resp.succeeded {
            return Err(KvError::txn_failed(format!("applying diff under {}", prefix)));
        }
        tracing::debug!(prefix, ops = diff.len(), revision = resp.revision, "diff applied");
        Ok(())
    }
}
