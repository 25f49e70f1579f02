//! Size-bounded framing of key diffs for transport.
//!
//! A framed diff is an overview frame with the insert/update/deletion counts,
//! followed by change frames. A change frame is closed before a change that
//! would push it past the maximum size, so a single oversized change still
//! travels alone in its own frame. Change size is key plus value length.
//!
//! Reassembly checks the contract and reports violations as
//! [`ContractError`]s.

use super::KeyDiff;
use crate::core::error::{ContractError, KvError, KvResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Operation counts announced by the first frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOverview {
    pub inserts: u64,
    pub updates: u64,
    pub deletions: u64,
}

/// Kind of a framed change. `Unspecified` is never valid on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Unspecified,
    Insert,
    Update,
    Deletion,
}

/// One framed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChange {
    pub change_type: ChangeType,
    pub key: String,
    /// Empty for deletions.
    pub value: Vec<u8>,
}

impl DiffChange {
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Transport frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffFrame {
    Overview(DiffOverview),
    Changes(Vec<DiffChange>),
}

/// Split `diff` into frames: the overview, then change frames of at most
/// `max_frame_size` bytes each (inserts, then updates, then deletions).
pub fn encode_frames(diff: &KeyDiff, max_frame_size: usize) -> Vec<DiffFrame> {
    let mut frames = vec![DiffFrame::Overview(DiffOverview {
        inserts: diff.inserts.len() as u64,
        updates: diff.updates.len() as u64,
        deletions: diff.deletions.len() as u64,
    })];

    let changes = diff
        .inserts
        .iter()
        .map(|(k, v)| (ChangeType::Insert, k, v.clone()))
        .chain(
            diff.updates
                .iter()
                .map(|(k, v)| (ChangeType::Update, k, v.clone())),
        )
        .chain(
            diff.deletions
                .iter()
                .map(|k| (ChangeType::Deletion, k, Vec::new())),
        )
        .map(|(change_type, key, value)| DiffChange {
            change_type,
            key: key.clone(),
            value,
        });

    let mut current: Vec<DiffChange> = Vec::new();
    let mut current_size = 0;
    for change in changes {
        let size = change.size();
        if !current.is_empty() && current_size + size > max_frame_size {
            frames.push(DiffFrame::Changes(std::mem::take(&mut current)));
            current_size = 0;
        }
        current_size += size;
        current.push(change);
    }
    if !current.is_empty() {
        frames.push(DiffFrame::Changes(current));
    }
    frames
}

/// Incremental reassembly of framed diffs.
#[derive(Debug, Default)]
pub struct DiffAssembler {
    overview: Option<DiffOverview>,
    diff: KeyDiff,
    received: DiffOverview,
}

impl DiffAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next frame.
    pub fn push(&mut self, frame: DiffFrame) -> Result<(), ContractError> {
        match (self.overview.is_some(), frame) {
            (false, DiffFrame::Overview(overview)) => {
                self.overview = Some(overview);
                Ok(())
            }
            (false, DiffFrame::Changes(_)) => Err(ContractError::FirstFrameNotOverview),
            (true, DiffFrame::Overview(_)) => Err(ContractError::FrameNotChanges),
            (true, DiffFrame::Changes(changes)) => {
                for change in changes {
                    match change.change_type {
                        ChangeType::Insert => {
                            self.received.inserts += 1;
                            self.diff.inserts.insert(change.key, change.value);
                        }
                        ChangeType::Update => {
                            self.received.updates += 1;
                            self.diff.updates.insert(change.key, change.value);
                        }
                        ChangeType::Deletion => {
                            self.received.deletions += 1;
                            self.diff.deletions.insert(change.key);
                        }
                        ChangeType::Unspecified => return Err(ContractError::InvalidChangeType),
                    }
                }
                Ok(())
            }
        }
    }

    /// Finish, checking the received operations against the overview.
    pub fn finish(self) -> Result<KeyDiff, ContractError> {
        let overview = self.overview.ok_or(ContractError::FirstFrameNotOverview)?;
        // Duplicate keys collapse in the maps, so count distinct entries too.
        let distinct = DiffOverview {
            inserts: self.diff.inserts.len() as u64,
            updates: self.diff.updates.len() as u64,
            deletions: self.diff.deletions.len() as u64,
        };
        if overview != self.received || overview != distinct {
            return Err(ContractError::OpsMiscount);
        }
        Ok(self.diff)
    }
}

/// Reassemble a complete frame sequence.
pub fn decode_frames(frames: impl IntoIterator<Item = DiffFrame>) -> Result<KeyDiff, ContractError> {
    let mut assembler = DiffAssembler::new();
    for frame in frames {
        assembler.push(frame)?;
    }
    assembler.finish()
}

/// Stream `diff` as frames from a spawned task. The task stops early when
/// `cancel` fires or the receiver is dropped.
pub fn send_frames(
    diff: KeyDiff,
    max_frame_size: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<DiffFrame> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for frame in encode_frames(&diff, max_frame_size) {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(frame) => sent.is_ok(),
            };
            if !sent {
                tracing::debug!("diff frame stream stopped early");
                return;
            }
        }
    });
    rx
}

/// Reassemble frames received on `frames` in a spawned task. The result is
/// sent once the sender side closes, or as soon as a violation is seen.
pub fn receive_frames(mut frames: mpsc::Receiver<DiffFrame>) -> oneshot::Receiver<KvResult<KeyDiff>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut assembler = DiffAssembler::new();
        while let Some(frame) = frames.recv().await {
            if let Err(err) = assembler.push(frame) {
                let _ = tx.send(Err(KvError::from(err)));
                return;
            }
        }
        let _ = tx.send(assembler.finish().map_err(KvError::from));
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff() -> KeyDiff {
        let mut diff = KeyDiff::default();
        diff.inserts.insert("a".into(), vec![b'x'; 6]);
        diff.inserts.insert("b".into(), vec![b'y'; 6]);
        diff.updates.insert("c".into(), vec![b'z'; 30]);
        diff.deletions.insert("d".into());
        diff
    }

    #[test]
    fn frames_respect_size_bound() {
        let frames = encode_frames(&diff(), 16);
        assert_eq!(
            frames[0],
            DiffFrame::Overview(DiffOverview {
                inserts: 2,
                updates: 1,
                deletions: 1
            })
        );
        let sizes: Vec<usize> = frames[1..]
            .iter()
            .map(|f| match f {
                DiffFrame::Changes(changes) => changes.len(),
                DiffFrame::Overview(_) => 0,
            })
            .collect();
        // a+b fit together (14 bytes), c is oversized and travels alone, d follows.
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[test]
    fn decode_reverses_encode() {
        let original = diff();
        assert_eq!(decode_frames(encode_frames(&original, 16)).unwrap(), original);
    }

    #[test]
    fn empty_diff_is_overview_only() {
        let frames = encode_frames(&KeyDiff::default(), 1024);
        assert_eq!(frames.len(), 1);
        assert!(decode_frames(frames).unwrap().is_empty());
    }

    #[test]
    fn contract_violations_are_reported() {
        let changes = DiffFrame::Changes(vec![DiffChange {
            change_type: ChangeType::Insert,
            key: "a".into(),
            value: b"1".to_vec(),
        }]);
        assert_eq!(
            decode_frames(vec![changes.clone()]),
            Err(ContractError::FirstFrameNotOverview)
        );
        assert_eq!(
            decode_frames(Vec::new()),
            Err(ContractError::FirstFrameNotOverview)
        );

        let overview = DiffFrame::Overview(DiffOverview {
            inserts: 2,
            ..DiffOverview::default()
        });
        assert_eq!(
            decode_frames(vec![overview.clone(), overview.clone()]),
            Err(ContractError::FrameNotChanges)
        );
        assert_eq!(
            decode_frames(vec![overview.clone(), changes]),
            Err(ContractError::OpsMiscount)
        );

        let invalid = DiffFrame::Changes(vec![DiffChange {
            change_type: ChangeType::Unspecified,
            key: "a".into(),
            value: Vec::new(),
        }]);
        assert_eq!(
            decode_frames(vec![overview, invalid]),
            Err(ContractError::InvalidChangeType)
        );
    }
}
