//! Group membership.
//!
//! A group is a key prefix; each member is the key `<prefix><member_id>` with
//! caller-supplied content. Members have no TTL: they join and leave
//! explicitly.

use crate::client::{Client, WatchOptions};
use crate::core::error::{KvError, KvResult};
use crate::diff::ValueMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Members of a group and the revision they were read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMembers {
    /// Content by member id.
    pub members: ValueMap,
    pub revision: i64,
}

/// How a threshold wait ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The group reached the threshold.
    Reached,
    /// The caller cancelled the wait.
    Cancelled,
}

/// Handle on a running threshold wait.
pub struct ThresholdWait {
    rx: oneshot::Receiver<KvResult<WaitOutcome>>,
}

impl ThresholdWait {
    /// Wait for the outcome.
    pub async fn wait(self) -> KvResult<WaitOutcome> {
        self.rx.await.unwrap_or_else(|_| {
            Err(KvError::WatchStopped {
                message: "threshold wait task ended without a result".to_string(),
            })
        })
    }

    /// Outcome if the wait already finished.
    pub fn try_outcome(&mut self) -> Option<KvResult<WaitOutcome>> {
        self.rx.try_recv().ok()
    }
}

impl Client {
    /// Join `group_prefix` as `member_id`.
    pub async fn join_group(
        &self,
        group_prefix: &str,
        member_id: &str,
        content: impl AsRef<[u8]>,
    ) -> KvResult<()> {
        self.put_key(&format!("{}{}", group_prefix, member_id), content)
            .await?;
        Ok(())
    }

    /// Leave `group_prefix`.
    pub async fn leave_group(&self, group_prefix: &str, member_id: &str) -> KvResult<()> {
        self.delete_key(&format!("{}{}", group_prefix, member_id))
            .await
    }

    /// Current members of `group_prefix`.
    pub async fn get_group_members(&self, group_prefix: &str) -> KvResult<GroupMembers> {
        let range = self.get_prefix(group_prefix).await?;
        Ok(GroupMembers {
            members: range.keys.to_value_map(group_prefix),
            revision: range.revision,
        })
    }

    /// Wait in the background until `group_prefix` has at least `threshold`
    /// members.
    ///
    /// Cancelling `cancel` ends the wait with [`WaitOutcome::Cancelled`]. A
    /// watch that ends before the threshold is reached is an error.
    pub fn wait_group_count_threshold(
        &self,
        group_prefix: &str,
        threshold: usize,
        cancel: CancellationToken,
    ) -> ThresholdWait {
        let (tx, rx) = oneshot::channel();
        let client = self.clone();
        let group_prefix = group_prefix.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
                outcome = client.watch_threshold(&group_prefix, threshold, &cancel) => outcome,
            };
            let _ = tx.send(outcome);
        });
        ThresholdWait { rx }
    }

    async fn watch_threshold(
        &self,
        group_prefix: &str,
        threshold: usize,
        cancel: &CancellationToken,
    ) -> KvResult<WaitOutcome> {
        let GroupMembers {
            mut members,
            revision,
        } = self.get_group_members(group_prefix).await?;
        if members.len() >= threshold {
            return Ok(WaitOutcome::Reached);
        }

        // Torn down with this wait, whichever way it ends.
        let watch_token = cancel.child_token();
        let _watch_guard = watch_token.clone().drop_guard();
        let mut changes = self.watch(
            group_prefix,
            WatchOptions {
                revision: revision + 1,
                is_prefix: true,
                trim_prefix: true,
            },
            watch_token,
        );

        while let Some(change) = changes.recv().await {
            change?.apply_on(&mut members);
            tracing::debug!(group = group_prefix, count = members.len(), threshold, "group changed");
            if members.len() >= threshold {
                return Ok(WaitOutcome::Reached);
            }
        }
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        Err(KvError::WatchStopped {
            message: "watch stopped before reaching threshold".to_string(),
        })
    }
}
