//! etcd v3 backend over `etcd-client`.
//!
//! Driver errors are mapped into [`KvError`] at this boundary so the retry
//! governor only ever sees the closed classification: gRPC `Unavailable` and
//! the dropped-proposal message become retriable, everything else is fatal.

use super::{
    DeleteResponse, EndpointStatus, EventType, KeyValue, KvBackend, LeaseGrant, Member,
    MemberList, PutResponse, RangeResponse, TxnOp, TxnRequest, TxnResponse, WatchBatch,
    WatchEvent, WatchStream,
};
use crate::backend::txn::{CompareOp, CompareTarget};
use crate::core::config::ClientConfig;
use crate::core::error::{KvError, KvResult, PROPOSAL_DROPPED_MESSAGE};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp as EtcdCompareOp, ConnectOptions, DeleteOptions,
    GetOptions, PutOptions, Txn, TxnOp as EtcdTxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

impl From<etcd_client::Error> for KvError {
    fn from(err: etcd_client::Error) -> Self {
        match &err {
            etcd_client::Error::GRpcStatus(status) => {
                if status.message().contains(PROPOSAL_DROPPED_MESSAGE) {
                    KvError::ProposalDropped
                } else if status.code() == tonic::Code::Unavailable {
                    KvError::unavailable(status.message())
                } else {
                    KvError::backend(err.to_string())
                }
            }
            etcd_client::Error::TransportError(_) => KvError::unavailable(err.to_string()),
            _ => KvError::backend(err.to_string()),
        }
    }
}

/// Backend speaking to an etcd cluster.
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    options: ConnectOptions,
}

impl EtcdBackend {
    /// Connect to the endpoints listed in `config`.
    pub async fn connect(config: &ClientConfig) -> KvResult<Self> {
        if config.endpoints.is_empty() {
            return Err(KvError::invalid("at least one endpoint is required"));
        }
        let options = connect_options(config);
        let client = Client::connect(&config.endpoints, Some(options.clone())).await?;
        tracing::info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self { client, options })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

fn connect_options(config: &ClientConfig) -> ConnectOptions {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(Duration::from_millis(config.connection.connection_timeout_ms))
        .with_timeout(Duration::from_millis(config.retry.request_timeout_ms));
    if let (Some(user), Some(password)) = (&config.connection.username, &config.connection.password)
    {
        options = options.with_user(user.clone(), password.clone());
    }
    options
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: kv.key().to_vec(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

fn convert_op(op: CompareOp) -> EtcdCompareOp {
    match op {
        CompareOp::Equal => EtcdCompareOp::Equal,
        CompareOp::NotEqual => EtcdCompareOp::NotEqual,
        CompareOp::Greater => EtcdCompareOp::Greater,
        CompareOp::Less => EtcdCompareOp::Less,
    }
}

fn convert_txn_op(op: TxnOp) -> EtcdTxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            EtcdTxnOp::put(key, value, options)
        }
        TxnOp::DeleteRange { key, range_end } => {
            let options = range_end.map(|end| DeleteOptions::new().with_range(end));
            EtcdTxnOp::delete(key, options)
        }
    }
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> i64 {
    header.map_or(0, |h| h.revision())
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        revision: Option<i64>,
    ) -> KvResult<RangeResponse> {
        let mut options = GetOptions::new();
        if let Some(end) = range_end {
            options = options.with_range(end.to_vec());
        }
        if let Some(rev) = revision.filter(|rev| *rev > 0) {
            options = options.with_revision(rev);
        }
        let resp = self.client().get(key.to_vec(), Some(options)).await?;
        Ok(RangeResponse {
            revision: header_revision(resp.header()),
            kvs: resp.kvs().iter().map(convert_kv).collect(),
        })
    }

    async fn put(&self, key: &[u8], value: &[u8], lease: Option<i64>) -> KvResult<PutResponse> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = self.client().put(key.to_vec(), value.to_vec(), options).await?;
        Ok(PutResponse {
            revision: header_revision(resp.header()),
        })
    }

    async fn delete_range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
    ) -> KvResult<DeleteResponse> {
        let options = range_end.map(|end| DeleteOptions::new().with_range(end.to_vec()));
        let resp = self.client().delete(key.to_vec(), options).await?;
        Ok(DeleteResponse {
            revision: header_revision(resp.header()),
            deleted: resp.deleted(),
        })
    }

    async fn txn(&self, request: TxnRequest) -> KvResult<TxnResponse> {
        let compares: Vec<EtcdCompare> = request
            .compares
            .into_iter()
            .map(|cmp| {
                let op = convert_op(cmp.op);
                match cmp.target {
                    CompareTarget::Version(v) => EtcdCompare::version(cmp.key, op, v),
                    CompareTarget::CreateRevision(v) => EtcdCompare::create_revision(cmp.key, op, v),
                    CompareTarget::ModRevision(v) => EtcdCompare::mod_revision(cmp.key, op, v),
                    CompareTarget::Value(v) => EtcdCompare::value(cmp.key, op, v),
                    CompareTarget::Lease(v) => EtcdCompare::lease(cmp.key, op, v),
                }
            })
            .collect();
        let txn = Txn::new()
            .when(compares)
            .and_then(request.success.into_iter().map(convert_txn_op).collect::<Vec<_>>())
            .or_else(request.failure.into_iter().map(convert_txn_op).collect::<Vec<_>>());
        let resp = self.client().txn(txn).await?;
        Ok(TxnResponse {
            succeeded: resp.succeeded(),
            revision: header_revision(resp.header()),
        })
    }

    async fn watch(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        start_revision: Option<i64>,
    ) -> KvResult<WatchStream> {
        let mut options = WatchOptions::new();
        if let Some(end) = range_end {
            options = options.with_range(end.to_vec());
        }
        if let Some(rev) = start_revision.filter(|rev| *rev > 0) {
            options = options.with_start_revision(rev);
        }
        let (mut watcher, mut stream) = self.client().watch(key.to_vec(), Some(options)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        if resp.compact_revision() > 0 {
                            let _ = tx.send(Err(KvError::RevisionCompacted {
                                revision: start_revision.unwrap_or(0),
                                compaction_floor: resp.compact_revision(),
                            }));
                            break;
                        }
                        if resp.canceled() {
                            let _ = tx.send(Err(KvError::WatchStopped {
                                message: resp.cancel_reason().to_string(),
                            }));
                            break;
                        }
                        if resp.events().is_empty() {
                            continue;
                        }
                        let events = resp
                            .events()
                            .iter()
                            .filter_map(|ev| {
                                let kv = ev.kv()?;
                                let event_type = match ev.event_type() {
                                    etcd_client::EventType::Put => EventType::Put,
                                    etcd_client::EventType::Delete => EventType::Delete,
                                };
                                Some(WatchEvent {
                                    event_type,
                                    kv: convert_kv(kv),
                                })
                            })
                            .collect();
                        let batch = WatchBatch {
                            revision: header_revision(resp.header()),
                            events,
                        };
                        if tx.send(Ok(batch)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(err.into()));
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(WatchStream::new(rx, Some(token.drop_guard())))
    }

    async fn lease_grant(&self, ttl: i64) -> KvResult<LeaseGrant> {
        let resp = self.client().lease_grant(ttl, None).await?;
        Ok(LeaseGrant {
            id: resp.id(),
            ttl: resp.ttl(),
        })
    }

    async fn lease_revoke(&self, lease_id: i64) -> KvResult<()> {
        self.client().lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn member_list(&self) -> KvResult<MemberList> {
        let resp = self.client().member_list(None).await?;
        let (cluster_id, member_id, revision, raft_term) = resp
            .header()
            .map_or((0, 0, 0, 0), |h| {
                (h.cluster_id(), h.member_id(), h.revision(), h.raft_term())
            });
        Ok(MemberList {
            cluster_id,
            member_id,
            revision,
            raft_term,
            members: resp
                .members()
                .iter()
                .map(|m| Member {
                    id: m.id(),
                    name: m.name().to_string(),
                    peer_urls: m.peer_urls().to_vec(),
                    client_urls: m.client_urls().to_vec(),
                    is_learner: m.is_learner(),
                })
                .collect(),
        })
    }

    async fn endpoint_status(&self, endpoint: &str) -> KvResult<EndpointStatus> {
        let mut client = Client::connect([endpoint], Some(self.options.clone())).await?;
        let resp = client.status().await?;
        Ok(EndpointStatus {
            version: resp.version().to_string(),
            db_size: resp.db_size(),
            db_size_in_use: resp.raft_used_db_size(),
            leader: resp.leader(),
            raft_index: resp.raft_index(),
            raft_term: resp.raft_term(),
            raft_applied_index: resp.raft_applied_index(),
            // Learner status comes from the member list.
            is_learner: false,
        })
    }

    async fn move_leader(&self, member_id: u64) -> KvResult<()> {
        self.client().move_leader(member_id).await?;
        Ok(())
    }
}
