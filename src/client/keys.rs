//! Single-key operations.

use super::Client;
use crate::backend::KeyValue;
use crate::core::error::KvResult;
use serde::{Deserialize, Serialize};

/// A key as read from the store, with its revision metadata.
///
/// Absence is never an error: reads return `Option<KeyInfo>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub value: Vec<u8>,
    /// Writes since the key was (re)created; starts at 1.
    pub version: i64,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Attached lease, 0 if none.
    pub lease: i64,
}

impl KeyInfo {
    /// Value as UTF-8, replacing invalid sequences.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

impl From<KeyValue> for KeyInfo {
    fn from(kv: KeyValue) -> Self {
        Self {
            key: String::from_utf8_lossy(&kv.key).into_owned(),
            value: kv.value,
            version: kv.version,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            lease: kv.lease,
        }
    }
}

impl Client {
    /// Read `key` at the latest revision.
    pub async fn get_key(&self, key: &str) -> KvResult<Option<KeyInfo>> {
        self.read_key(key, None).await
    }

    /// Read `key` as it was at `revision`.
    pub async fn get_key_at_revision(&self, key: &str, revision: i64) -> KvResult<Option<KeyInfo>> {
        self.read_key(key, Some(revision)).await
    }

    async fn read_key(&self, key: &str, revision: Option<i64>) -> KvResult<Option<KeyInfo>> {
        let resp = self
            .call("get_key", |store| store.range(key.as_bytes(), None, revision))
            .await?;
        Ok(resp
            .kvs
            .into_iter()
            .find(|kv| kv.create_revision != 0)
            .map(KeyInfo::from))
    }

    /// Unconditional upsert. Returns the revision of the write.
    pub async fn put_key(&self, key: &str, value: impl AsRef<[u8]>) -> KvResult<i64> {
        let value = value.as_ref();
        let resp = self
            .call("put_key", |store| store.put(key.as_bytes(), value, None))
            .await?;
        Ok(resp.revision)
    }

    /// Unconditional removal. Deleting an absent key succeeds.
    pub async fn delete_key(&self, key: &str) -> KvResult<()> {
        self.call("delete_key", |store| store.delete_range(key.as_bytes(), None))
            .await?;
        Ok(())
    }
}
