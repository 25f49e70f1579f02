//! Client handle.
//!
//! [`Client`] pairs a store backend with an explicit [`RetryPolicy`] and the
//! loaded [`ClientConfig`]. It holds no mutable state across calls; cloning is
//! cheap and every clone talks to the same backend. Every remote call issued by
//! the handle goes through the retry governor.
//!
//! Operations are grouped by area:
//! - [`keys`] - single-key get/put/delete
//! - [`range`] - range and prefix reads and deletes
//! - [`watch`] - change feeds as cancellable tasks
//! - [`conditions`] - transaction compare helpers
//! - [`diff`] - store-side keyspace diffs
//! - [`cluster`] - member listing and leadership maintenance
//!
//! Chunked keys, locks and groups live in their own top-level modules and
//! extend this handle.

pub mod cluster;
pub mod conditions;
pub mod diff;
pub mod keys;
pub mod range;
pub mod watch;

use crate::backend::memory::MemoryBackend;
use crate::backend::KvBackend;
use crate::core::config::ClientConfig;
use crate::core::error::KvResult;
use crate::core::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;

pub use cluster::{ClusterMember, ClusterMembers, MemberStatus};
pub use keys::KeyInfo;
pub use range::{KeyInfoMap, KeyRangeInfo};
pub use watch::{WatchInfo, WatchOptions};

/// Retry-governed client over a store backend.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn KvBackend>,
    policy: RetryPolicy,
    config: Arc<ClientConfig>,
}

impl Client {
    /// Create a client over `backend`; the retry policy comes from `config`.
    pub fn new(backend: Arc<dyn KvBackend>, config: ClientConfig) -> Self {
        Self {
            backend,
            policy: config.retry_policy(),
            config: Arc::new(config),
        }
    }

    /// Create a client over a fresh in-memory store, returning both.
    pub fn in_memory(config: ClientConfig) -> (Self, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (Self::new(backend.clone(), config), backend)
    }

    /// Connect to an etcd cluster using `config.endpoints`.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: ClientConfig) -> KvResult<Self> {
        let backend = crate::backend::etcd::EtcdBackend::connect(&config).await?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Handle sharing this backend with a different retry policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            backend: self.backend.clone(),
            policy,
            config: self.config.clone(),
        }
    }

    /// Retry policy applied to every remote call.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn KvBackend {
        self.backend.as_ref()
    }

    /// Run one backend call under the retry governor.
    pub(crate) async fn call<'a, T, F, Fut>(&'a self, operation: &'static str, op: F) -> KvResult<T>
    where
        F: FnMut(&'a dyn KvBackend) -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let mut op = op;
        let store = self.store();
        self.policy.run(operation, || op(store)).await
    }
}
