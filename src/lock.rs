//! Lease-backed distributed lock.
//!
//! A lock is a key holding a JSON [`Lock`] payload, bound to a lease with the
//! lock TTL. Acquisition:
//! 1. probe the key without a lease; if held, wait and retry
//! 2. grant a lease and commit the payload if the key is still absent and
//!    every extra condition holds
//! 3. on a lost race revoke the lease, wait and retry
//!
//! Contention never consumes retry budget; it is bounded by the caller's
//! timeout only. Transient store errors consume budget as usual. A holder
//! that dies loses the lock once its lease expires.

use crate::backend::{Compare, TxnOp, TxnRequest};
use crate::client::conditions::key_present;
use crate::client::Client;
use crate::core::error::{KvError, KvResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Lock payload stored at the lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Lock {
    /// Lease backing the lock key.
    #[serde(rename = "Lease")]
    pub lease_id: i64,
    /// Lease TTL in seconds.
    pub ttl: i64,
    #[serde(rename = "Timestamp")]
    pub acquired_at: DateTime<Utc>,
    /// Revision at which the lock was taken. Not part of the stored payload.
    #[serde(skip)]
    pub revision: i64,
}

/// Options for [`Client::acquire_lock`]. Zero values take the configured
/// lock defaults.
#[derive(Debug, Clone, Default)]
pub struct AcquireLockOptions {
    pub key: String,
    /// Lease TTL in seconds.
    pub ttl: i64,
    /// How long to keep trying.
    pub timeout: Duration,
    /// Wait between contended attempts.
    pub retry_interval: Duration,
    /// Conditions that must also hold for the lock to be taken.
    pub extra_conditions: Vec<Compare>,
}

impl AcquireLockOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

impl Client {
    /// Acquire the lock at `options.key`.
    ///
    /// Fails with [`KvError::LockDeadlineExceeded`] if the lock could not be
    /// taken before the timeout.
    pub async fn acquire_lock(&self, options: AcquireLockOptions) -> KvResult<Lock> {
        let defaults = &self.config().lock;
        let ttl = if options.ttl == 0 {
            defaults.default_ttl_seconds
        } else {
            options.ttl
        };
        let timeout = if options.timeout.is_zero() {
            Duration::from_millis(defaults.default_timeout_ms)
        } else {
            options.timeout
        };
        let retry_interval = if options.retry_interval.is_zero() {
            Duration::from_millis(defaults.default_retry_interval_ms)
        } else {
            options.retry_interval
        };
        let key = options.key.as_str();
        let deadline = Instant::now() + timeout;
        let mut budget = self.policy().budget();

        loop {
            if Instant::now() > deadline {
                return Err(KvError::LockDeadlineExceeded {
                    key: key.to_string(),
                });
            }

            let probe = self
                .policy()
                .attempt(self.store().range(key.as_bytes(), None, None))
                .await;
            match probe {
                Ok(resp) if !resp.kvs.is_empty() => {
                    tracing::debug!(key, "lock held elsewhere, waiting");
                    tokio::time::sleep(retry_interval).await;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    if !budget.consume("acquire_lock", &err) {
                        return Err(err);
                    }
                    budget.wait().await;
                    continue;
                }
            }

            let lease = match self.policy().attempt(self.store().lease_grant(ttl)).await {
                Ok(lease) => lease,
                Err(err) => {
                    if !budget.consume("acquire_lock", &err) {
                        return Err(err);
                    }
                    budget.wait().await;
                    continue;
                }
            };

            let mut lock = Lock {
                lease_id: lease.id,
                ttl,
                acquired_at: Utc::now(),
                revision: 0,
            };
            let payload = serde_json::to_vec(&lock)?;
            let mut compares = vec![key_present(key, false)];
            compares.extend(options.extra_conditions.iter().cloned());
            let request = TxnRequest::when(
                compares,
                vec![TxnOp::put_with_lease(key, payload, lease.id)],
            );

            match self.policy().attempt(self.store().txn(request)).await {
                Ok(resp) if resp.succeeded => {
                    lock.revision = resp.revision;
                    tracing::info!(key, lease_id = lease.id, ttl, "lock acquired");
                    return Ok(lock);
                }
                Ok(_) => {
                    self.revoke_lease(lease.id).await?;
                    tracing::debug!(key, "lost lock race, waiting");
                    tokio::time::sleep(retry_interval).await;
                }
                Err(err) => {
                    let revoked = self.revoke_lease(lease.id).await;
                    if revoked.is_err() || !budget.consume("acquire_lock", &err) {
                        return Err(err);
                    }
                    budget.wait().await;
                }
            }
        }
    }

    /// Read the payload of the lock at `key`.
    pub async fn read_lock(&self, key: &str) -> KvResult<Lock> {
        let info = self
            .get_key(key)
            .await?
            .ok_or_else(|| KvError::key_not_found(key))?;
        let mut lock: Lock = serde_json::from_slice(&info.value)?;
        lock.revision = info.mod_revision;
        Ok(lock)
    }

    /// Release the lock at `key` by revoking its lease.
    ///
    /// Releasing a lock that no longer exists fails with
    /// [`KvError::KeyNotFound`].
    pub async fn release_lock(&self, key: &str) -> KvResult<()> {
        let lock = self.read_lock(key).await?;
        self.revoke_lease(lock.lease_id).await?;
        tracing::info!(key, lease_id = lock.lease_id, "lock released");
        Ok(())
    }

    async fn revoke_lease(&self, lease_id: i64) -> KvResult<()> {
        self.call("lease_revoke", |store| store.lease_revoke(lease_id))
            .await
    }
}
