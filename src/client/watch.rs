//! Change feeds.
//!
//! A watch runs as a spawned task that forwards backend batches, translated
//! into [`WatchInfo`], to a bounded channel. The task stops when:
//! - the caller cancels the token (nothing is delivered afterwards)
//! - the backend feed ends
//! - an error has been delivered (errors are terminal)
//! - the receiver is dropped
//!
//! In every case the channel is closed once, when the task drops its sender.

use super::{Client, KeyInfo};
use crate::backend::{prefix_range_end, EventType, WatchBatch};
use crate::core::error::KvResult;
use crate::diff::{KeyDiff, ValueMap};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Options for [`Client::watch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Replay changes from this revision when > 0.
    pub revision: i64,
    /// Treat the key as a prefix.
    pub is_prefix: bool,
    /// Strip the watched key from the reported keys.
    pub trim_prefix: bool,
}

/// Changes carried by one store revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchInfo {
    /// Created or updated keys.
    pub upserts: BTreeMap<String, KeyInfo>,
    /// Deleted keys.
    pub deletions: Vec<String>,
}

impl WatchInfo {
    fn from_batch(batch: WatchBatch, trim: Option<&str>) -> Self {
        let mut info = WatchInfo::default();
        for event in batch.events {
            let mut record = KeyInfo::from(event.kv);
            if let Some(prefix) = trim {
                if let Some(stripped) = record.key.strip_prefix(prefix) {
                    record.key = stripped.to_string();
                }
            }
            // Last event for a key within the batch decides its fate.
            match event.event_type {
                EventType::Put => {
                    info.deletions.retain(|k| k != &record.key);
                    info.upserts.insert(record.key.clone(), record);
                }
                EventType::Delete => {
                    info.upserts.remove(&record.key);
                    if !info.deletions.contains(&record.key) {
                        info.deletions.push(record.key);
                    }
                }
            }
        }
        info
    }

    /// Apply these changes to a key/value map.
    pub fn apply_on(&self, values: &mut ValueMap) {
        for key in &self.deletions {
            values.remove(key);
        }
        for (key, info) in &self.upserts {
            values.insert(key.clone(), info.value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }
}

impl Client {
    /// Watch `key` (or every key under it with `is_prefix`).
    ///
    /// Each received item is either a batch of changes, or an error after
    /// which the channel closes.
    pub fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<KvResult<WatchInfo>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let client = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            client.forward_watch(key, options, cancel, tx).await;
        });
        rx
    }

    async fn forward_watch(
        &self,
        key: String,
        options: WatchOptions,
        cancel: CancellationToken,
        tx: mpsc::Sender<KvResult<WatchInfo>>,
    ) {
        let range_end = options
            .is_prefix
            .then(|| prefix_range_end(key.as_bytes()));
        let start = (options.revision > 0).then_some(options.revision);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self.call("watch", |store| store.watch(key.as_bytes(), range_end.as_deref(), start)) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(key = %key, error = %err, "watch could not be established");
                deliver(&tx, &cancel, Err(err)).await;
                return;
            }
        };

        let trim = options.trim_prefix.then_some(key.as_str());
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(batch)) => {
                    let info = WatchInfo::from_batch(batch, trim);
                    if !deliver(&tx, &cancel, Ok(info)).await {
                        break;
                    }
                }
                Some(Err(err)) => {
                    deliver(&tx, &cancel, Err(err)).await;
                    break;
                }
                None => break,
            }
        }
        tracing::debug!(key = %key, "watch closed");
    }

    /// Watch every key under `prefix` from `revision`, reporting changes as
    /// diffs over prefix-relative keys. Puts of freshly created keys are
    /// inserts, other puts are updates.
    pub fn watch_prefix_changes(
        &self,
        prefix: &str,
        revision: i64,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<KvResult<KeyDiff>> {
        let mut changes = self.watch(
            prefix,
            WatchOptions {
                revision,
                is_prefix: true,
                trim_prefix: true,
            },
            cancel.clone(),
        );
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(item) = changes.recv().await {
                let item = item.map(|info| {
                    let mut diff = KeyDiff::default();
                    for (key, record) in info.upserts {
                        if record.version == 1 {
                            diff.inserts.insert(key, record.value);
                        } else {
                            diff.updates.insert(key, record.value);
                        }
                    }
                    diff.deletions.extend(info.deletions);
                    diff
                });
                if !deliver(&tx, &cancel, item).await {
                    break;
                }
            }
        });
        rx
    }
}

/// Send unless cancelled or the receiver is gone. Returns whether the item was
/// delivered.
async fn deliver<T>(tx: &mpsc::Sender<T>, cancel: &CancellationToken, item: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KeyValue, WatchEvent};

    fn event(event_type: EventType, key: &str, value: &str, version: i64) -> WatchEvent {
        WatchEvent {
            event_type,
            kv: KeyValue {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
                create_revision: 4,
                mod_revision: 9,
                version,
                lease: 0,
            },
        }
    }

    #[test]
    fn last_event_per_key_wins_within_a_batch() {
        let batch = WatchBatch {
            revision: 9,
            events: vec![
                event(EventType::Put, "/g/a", "1", 1),
                event(EventType::Delete, "/g/a", "", 0),
                event(EventType::Delete, "/g/b", "", 0),
                event(EventType::Put, "/g/b", "2", 1),
            ],
        };
        let info = WatchInfo::from_batch(batch, Some("/g/"));
        assert_eq!(info.deletions, vec!["a".to_string()]);
        assert_eq!(info.upserts.len(), 1);
        assert_eq!(info.upserts["b"].value, b"2".to_vec());
    }

    #[test]
    fn apply_on_upserts_and_removes() {
        let mut values = ValueMap::new();
        values.insert("old".to_string(), b"x".to_vec());
        let info = WatchInfo::from_batch(
            WatchBatch {
                revision: 3,
                events: vec![
                    event(EventType::Delete, "old", "", 0),
                    event(EventType::Put, "new", "y", 1),
                ],
            },
            None,
        );
        info.apply_on(&mut values);
        assert_eq!(values.len(), 1);
        assert_eq!(values["new"], b"y".to_vec());
    }
}
