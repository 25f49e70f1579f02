//! In-process MVCC store.
//!
//! Mirrors the store semantics the client relies on:
//! - one global revision, bumped once per committed write batch
//! - per-key history so reads at past revisions see old values and deleted keys
//! - leases with TTL deadlines on the tokio clock; expiry is evaluated lazily at
//!   the start of every call and deletes attached keys at a new revision
//! - prefix/range watches with replay from a start revision
//! - a simulated member list with a leader, for leadership maintenance
//!
//! Fault rules make calls fail with the retriable error kinds so retry paths
//! can be exercised deterministically.

use super::{
    key_in_range, Compare, DeleteResponse, EndpointStatus, EventType, KeyValue, KvBackend,
    LeaseGrant, Member, MemberList, PutResponse, RangeResponse, TxnOp, TxnRequest, TxnResponse,
    WatchBatch, WatchEvent, WatchStream,
};
use crate::core::error::{KvError, KvResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Backend call selector for fault rules and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Range,
    Put,
    DeleteRange,
    Txn,
    Watch,
    LeaseGrant,
    LeaseRevoke,
    MemberList,
    EndpointStatus,
    MoveLeader,
}

/// Error produced by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retriable: store unavailable.
    Unavailable,
    /// Retriable: proposal dropped during a leader change.
    ProposalDropped,
    /// Fatal backend error.
    Fatal,
}

impl FaultKind {
    fn to_error(self) -> KvError {
        match self {
            Self::Unavailable => KvError::unavailable("injected: etcdserver: leader changed"),
            Self::ProposalDropped => KvError::ProposalDropped,
            Self::Fatal => KvError::backend("injected fatal fault"),
        }
    }
}

#[derive(Debug)]
struct FaultRule {
    op: Option<BackendOp>,
    /// `None` fails forever.
    remaining: Option<u64>,
    kind: FaultKind,
}

/// One entry of a key's history. `kv == None` is a tombstone.
#[derive(Debug, Clone)]
struct Revisioned {
    mod_revision: i64,
    kv: Option<KeyValue>,
}

#[derive(Debug)]
struct LeaseEntry {
    deadline: Instant,
    keys: HashSet<Vec<u8>>,
}

struct Watcher {
    key: Vec<u8>,
    range_end: Option<Vec<u8>>,
    tx: mpsc::UnboundedSender<KvResult<WatchBatch>>,
}

impl Watcher {
    fn matching(&self, events: &[WatchEvent]) -> Vec<WatchEvent> {
        events
            .iter()
            .filter(|e| key_in_range(&e.kv.key, &self.key, self.range_end.as_deref()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct SimMember {
    member: Member,
    responsive: bool,
}

#[derive(Debug)]
struct ClusterState {
    cluster_id: u64,
    leader: u64,
    raft_term: u64,
    members: Vec<SimMember>,
}

impl ClusterState {
    fn with_names(names: &[&str]) -> Self {
        let members = names
            .iter()
            .enumerate()
            .map(|(idx, name)| SimMember {
                member: Member {
                    id: idx as u64 + 1,
                    name: name.to_string(),
                    peer_urls: vec![format!("mem://{}:2380", name)],
                    client_urls: vec![format!("mem://{}:2379", name)],
                    is_learner: false,
                },
                responsive: true,
            })
            .collect();
        Self {
            cluster_id: 0x6c61_7474,
            leader: 1,
            raft_term: 2,
            members,
        }
    }

    fn find_by_name_mut(&mut self, name: &str) -> Option<&mut SimMember> {
        self.members.iter_mut().find(|m| m.member.name == name)
    }
}

/// Writes committed together at one revision.
struct WriteBatch {
    revision: i64,
    events: Vec<WatchEvent>,
}

struct MemoryState {
    revision: i64,
    compaction_floor: i64,
    keys: BTreeMap<Vec<u8>, Vec<Revisioned>>,
    log: Vec<WatchBatch>,
    leases: HashMap<i64, LeaseEntry>,
    next_lease_id: i64,
    watchers: Vec<Watcher>,
    cluster: ClusterState,
}

impl MemoryState {
    fn new(cluster: ClusterState) -> Self {
        Self {
            revision: 1,
            compaction_floor: 0,
            keys: BTreeMap::new(),
            log: Vec::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
            watchers: Vec::new(),
            cluster,
        }
    }

    fn current(&self, key: &[u8]) -> Option<&KeyValue> {
        self.keys
            .get(key)
            .and_then(|history| history.last())
            .and_then(|entry| entry.kv.as_ref())
    }

    fn at_revision(history: &[Revisioned], revision: i64) -> Option<&KeyValue> {
        history
            .iter()
            .rev()
            .find(|entry| entry.mod_revision <= revision)
            .and_then(|entry| entry.kv.as_ref())
    }

    fn keys_in_range(&self, start: &[u8], range_end: Option<&[u8]>) -> Vec<Vec<u8>> {
        match range_end {
            None => self
                .keys
                .get_key_value(start)
                .map(|(k, _)| vec![k.clone()])
                .unwrap_or_default(),
            Some([0]) => self.keys.range(start.to_vec()..).map(|(k, _)| k.clone()).collect(),
            Some(end) if start < end => self
                .keys
                .range(start.to_vec()..end.to_vec())
                .map(|(k, _)| k.clone())
                .collect(),
            Some(_) => Vec::new(),
        }
    }

    fn range(
        &self,
        start: &[u8],
        range_end: Option<&[u8]>,
        revision: Option<i64>,
    ) -> KvResult<Vec<KeyValue>> {
        let read_revision = match revision.filter(|rev| *rev > 0) {
            Some(rev) if rev < self.compaction_floor => {
                return Err(KvError::RevisionCompacted {
                    revision: rev,
                    compaction_floor: self.compaction_floor,
                })
            }
            Some(rev) if rev > self.revision => {
                return Err(KvError::invalid(format!(
                    "required revision {} is a future revision (current {})",
                    rev, self.revision
                )))
            }
            Some(rev) => rev,
            None => self.revision,
        };

        let kvs = self
            .keys_in_range(start, range_end)
            .into_iter()
            .filter_map(|key| {
                self.keys
                    .get(&key)
                    .and_then(|history| Self::at_revision(history, read_revision))
                    .cloned()
            })
            .collect();
        Ok(kvs)
    }

    fn begin(&self) -> WriteBatch {
        WriteBatch {
            revision: self.revision + 1,
            events: Vec::new(),
        }
    }

    fn check_leases(&self, ops: &[TxnOp]) -> KvResult<()> {
        for op in ops {
            if let TxnOp::Put {
                lease: Some(lease_id),
                ..
            } = op
            {
                if *lease_id != 0 && !self.leases.contains_key(lease_id) {
                    return Err(KvError::LeaseNotFound {
                        lease_id: *lease_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn put_in(&mut self, batch: &mut WriteBatch, key: &[u8], value: &[u8], lease: Option<i64>) {
        let lease = lease.unwrap_or(0);
        let prev = self.current(key).cloned();
        let (create_revision, version) = match &prev {
            Some(p) => (p.create_revision, p.version + 1),
            None => (batch.revision, 1),
        };

        if let Some(p) = &prev {
            if p.lease != 0 && p.lease != lease {
                if let Some(entry) = self.leases.get_mut(&p.lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if lease != 0 {
            if let Some(entry) = self.leases.get_mut(&lease) {
                entry.keys.insert(key.to_vec());
            }
        }

        let kv = KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            create_revision,
            mod_revision: batch.revision,
            version,
            lease,
        };
        self.keys.entry(key.to_vec()).or_default().push(Revisioned {
            mod_revision: batch.revision,
            kv: Some(kv.clone()),
        });
        batch.events.push(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
    }

    fn delete_in(&mut self, batch: &mut WriteBatch, start: &[u8], range_end: Option<&[u8]>) -> i64 {
        let mut deleted = 0;
        for key in self.keys_in_range(start, range_end) {
            let Some(prev) = self.current(&key).cloned() else {
                continue;
            };
            if prev.lease != 0 {
                if let Some(entry) = self.leases.get_mut(&prev.lease) {
                    entry.keys.remove(&key);
                }
            }
            self.keys.entry(key.clone()).or_default().push(Revisioned {
                mod_revision: batch.revision,
                kv: None,
            });
            batch.events.push(WatchEvent {
                event_type: EventType::Delete,
                kv: KeyValue {
                    key,
                    value: Vec::new(),
                    create_revision: 0,
                    mod_revision: batch.revision,
                    version: 0,
                    lease: 0,
                },
            });
            deleted += 1;
        }
        deleted
    }

    fn apply_ops(&mut self, batch: &mut WriteBatch, ops: &[TxnOp]) {
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => self.put_in(batch, key, value, *lease),
                TxnOp::DeleteRange { key, range_end } => {
                    self.delete_in(batch, key, range_end.as_deref());
                }
            }
        }
    }

    /// Commit a batch. Batches without events leave the revision unchanged.
    fn commit(&mut self, batch: WriteBatch) {
        if batch.events.is_empty() {
            return;
        }
        self.revision = batch.revision;
        let committed = WatchBatch {
            revision: batch.revision,
            events: batch.events,
        };
        self.watchers.retain(|watcher| {
            let events = watcher.matching(&committed.events);
            if events.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchBatch {
                    revision: committed.revision,
                    events,
                }))
                .is_ok()
        });
        self.log.push(committed);
    }

    fn revoke(&mut self, lease_id: i64) -> bool {
        let Some(entry) = self.leases.remove(&lease_id) else {
            return false;
        };
        let mut batch = self.begin();
        let mut keys: Vec<_> = entry.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete_in(&mut batch, &key, None);
        }
        self.commit(batch);
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let mut expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for lease_id in expired {
            tracing::debug!(lease_id, "lease expired");
            self.revoke(lease_id);
        }
    }

    fn compact(&mut self, revision: i64) {
        if revision <= self.compaction_floor {
            return;
        }
        let revision = revision.min(self.revision);
        self.compaction_floor = revision;
        self.log.retain(|batch| batch.revision >= revision);
        self.keys.retain(|_, history| {
            // Keep the newest entry at or below the floor so reads at the
            // floor still resolve.
            let keep_from = history
                .iter()
                .rposition(|entry| entry.mod_revision <= revision)
                .unwrap_or(0);
            history.drain(..keep_from);
            !(history.len() == 1 && history[0].kv.is_none())
        });
    }
}

/// In-memory [`KvBackend`] implementation.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    faults: Mutex<Vec<FaultRule>>,
    calls: Mutex<HashMap<BackendOp, u64>>,
}

impl MemoryBackend {
    /// Create a store with a single member named `default`.
    pub fn new() -> Self {
        Self::with_members(&["default"])
    }

    /// Create a store whose simulated cluster has the given members; the first
    /// one starts as leader.
    pub fn with_members(names: &[&str]) -> Self {
        Self {
            state: Mutex::new(MemoryState::new(ClusterState::with_names(names))),
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` calls (of `op`, or of any call when `None`).
    pub fn fail_next(&self, op: Option<BackendOp>, count: u64, kind: FaultKind) {
        self.faults.lock().push(FaultRule {
            op,
            remaining: Some(count),
            kind,
        });
    }

    /// Fail every call (of `op`, or of any call when `None`) until cleared.
    pub fn fail_always(&self, op: Option<BackendOp>, kind: FaultKind) {
        self.faults.lock().push(FaultRule {
            op,
            remaining: None,
            kind,
        });
    }

    /// Remove all fault rules.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of calls of `op` received so far, failed ones included.
    pub fn call_count(&self, op: BackendOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Number of calls received so far, failed ones included.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Current store revision.
    pub fn current_revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state.leases.len()
    }

    /// Discard history below `revision`.
    pub fn compact(&self, revision: i64) {
        self.state.lock().compact(revision);
    }

    /// Mark a member as reachable or not for status probes and leader moves.
    pub fn set_member_responsive(&self, name: &str, responsive: bool) {
        if let Some(member) = self.state.lock().cluster.find_by_name_mut(name) {
            member.responsive = responsive;
        }
    }

    /// Mark a member as learner or voter.
    pub fn set_member_learner(&self, name: &str, is_learner: bool) {
        if let Some(member) = self.state.lock().cluster.find_by_name_mut(name) {
            member.member.is_learner = is_learner;
        }
    }

    /// Name of the current leader.
    pub fn leader_name(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .cluster
            .members
            .iter()
            .find(|m| m.member.id == state.cluster.leader)
            .map(|m| m.member.name.clone())
    }

    fn enter(&self, op: BackendOp) -> KvResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let mut faults = self.faults.lock();
        let rule = faults
            .iter_mut()
            .find(|rule| rule.op.map_or(true, |o| o == op) && rule.remaining != Some(0));
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(rule.kind.to_error());
        }
        Ok(())
    }

    fn locked(&self) -> parking_lot::MutexGuard<'_, MemoryState> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        revision: Option<i64>,
    ) -> KvResult<RangeResponse> {
        self.enter(BackendOp::Range)?;
        let state = self.locked();
        let kvs = state.range(key, range_end, revision)?;
        Ok(RangeResponse {
            revision: state.revision,
            kvs,
        })
    }

    async fn put(&self, key: &[u8], value: &[u8], lease: Option<i64>) -> KvResult<PutResponse> {
        self.enter(BackendOp::Put)?;
        let mut state = self.locked();
        let op = TxnOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            lease,
        };
        state.check_leases(std::slice::from_ref(&op))?;
        let mut batch = state.begin();
        state.apply_ops(&mut batch, std::slice::from_ref(&op));
        state.commit(batch);
        Ok(PutResponse {
            revision: state.revision,
        })
    }

    async fn delete_range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
    ) -> KvResult<DeleteResponse> {
        self.enter(BackendOp::DeleteRange)?;
        let mut state = self.locked();
        let mut batch = state.begin();
        let deleted = state.delete_in(&mut batch, key, range_end);
        state.commit(batch);
        Ok(DeleteResponse {
            revision: state.revision,
            deleted,
        })
    }

    async fn txn(&self, request: TxnRequest) -> KvResult<TxnResponse> {
        self.enter(BackendOp::Txn)?;
        let mut state = self.locked();
        let succeeded = request
            .compares
            .iter()
            .all(|cmp: &Compare| cmp.evaluate(state.current(&cmp.key)));
        let ops = if succeeded {
            &request.success
        } else {
            &request.failure
        };
        state.check_leases(ops)?;
        let mut batch = state.begin();
        state.apply_ops(&mut batch, ops);
        state.commit(batch);
        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
        })
    }

    async fn watch(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        start_revision: Option<i64>,
    ) -> KvResult<WatchStream> {
        self.enter(BackendOp::Watch)?;
        let mut state = self.locked();
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            key: key.to_vec(),
            range_end: range_end.map(|end| end.to_vec()),
            tx,
        };

        if let Some(start) = start_revision.filter(|rev| *rev > 0) {
            if start < state.compaction_floor {
                let _ = watcher.tx.send(Err(KvError::RevisionCompacted {
                    revision: start,
                    compaction_floor: state.compaction_floor,
                }));
                return Ok(WatchStream::new(rx, None));
            }
            for batch in state.log.iter().filter(|b| b.revision >= start) {
                let events = watcher.matching(&batch.events);
                if !events.is_empty() {
                    let _ = watcher.tx.send(Ok(WatchBatch {
                        revision: batch.revision,
                        events,
                    }));
                }
            }
        }

        state.watchers.push(watcher);
        Ok(WatchStream::new(rx, None))
    }

    async fn lease_grant(&self, ttl: i64) -> KvResult<LeaseGrant> {
        self.enter(BackendOp::LeaseGrant)?;
        if ttl <= 0 {
            return Err(KvError::invalid(format!("lease ttl must be > 0, got {}", ttl)));
        }
        let mut state = self.locked();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
                keys: HashSet::new(),
            },
        );
        Ok(LeaseGrant { id, ttl })
    }

    async fn lease_revoke(&self, lease_id: i64) -> KvResult<()> {
        self.enter(BackendOp::LeaseRevoke)?;
        let mut state = self.locked();
        if state.revoke(lease_id) {
            Ok(())
        } else {
            Err(KvError::LeaseNotFound { lease_id })
        }
    }

    async fn member_list(&self) -> KvResult<MemberList> {
        self.enter(BackendOp::MemberList)?;
        let state = self.locked();
        Ok(MemberList {
            cluster_id: state.cluster.cluster_id,
            member_id: state.cluster.leader,
            revision: state.revision,
            raft_term: state.cluster.raft_term,
            members: state
                .cluster
                .members
                .iter()
                .map(|m| m.member.clone())
                .collect(),
        })
    }

    async fn endpoint_status(&self, endpoint: &str) -> KvResult<EndpointStatus> {
        self.enter(BackendOp::EndpointStatus)?;
        let state = self.locked();
        let member = state
            .cluster
            .members
            .iter()
            .find(|m| m.member.client_urls.iter().any(|url| url == endpoint))
            .ok_or_else(|| KvError::unavailable(format!("no member serves {}", endpoint)))?;
        if !member.responsive {
            return Err(KvError::unavailable(format!("{} is not responding", endpoint)));
        }

        let db_size: i64 = state
            .keys
            .iter()
            .flat_map(|(key, history)| history.iter().map(move |e| (key, e)))
            .map(|(key, entry)| {
                (key.len() + entry.kv.as_ref().map_or(0, |kv| kv.value.len()) + 32) as i64
            })
            .sum();
        Ok(EndpointStatus {
            version: "3.5.0".to_string(),
            db_size,
            db_size_in_use: db_size,
            leader: state.cluster.leader,
            raft_index: state.revision as u64,
            raft_term: state.cluster.raft_term,
            raft_applied_index: state.revision as u64,
            is_learner: member.member.is_learner,
        })
    }

    async fn move_leader(&self, member_id: u64) -> KvResult<()> {
        self.enter(BackendOp::MoveLeader)?;
        let mut state = self.locked();
        let target = state
            .cluster
            .members
            .iter()
            .find(|m| m.member.id == member_id)
            .cloned()
            .ok_or_else(|| KvError::backend(format!("member {:x} not found", member_id)))?;
        if target.member.is_learner {
            return Err(KvError::backend("cannot transfer leadership to a learner"));
        }
        if !target.responsive {
            return Err(KvError::unavailable("leadership transferee is not responding"));
        }
        if state.cluster.leader != member_id {
            state.cluster.leader = member_id;
            state.cluster.raft_term += 1;
            tracing::info!(leader = member_id, term = state.cluster.raft_term, "leader moved");
        }
        Ok(())
    }
}
