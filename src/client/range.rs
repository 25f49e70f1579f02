//! Range and prefix operations.
//!
//! A range covers the half-open interval `[start, end)`; a prefix is the range
//! ending at [`prefix_range_end`] of the prefix.

use super::{Client, KeyInfo};
use crate::backend::prefix_range_end;
use crate::core::error::KvResult;
use crate::diff::ValueMap;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// Keys returned by a range read, indexed by full key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInfoMap(pub BTreeMap<String, KeyInfo>);

impl KeyInfoMap {
    /// Flatten to key/value pairs, trimming `prefix_trim` from the start of
    /// every key that carries it.
    pub fn to_value_map(&self, prefix_trim: &str) -> ValueMap {
        self.0
            .iter()
            .map(|(key, info)| {
                let key = key.strip_prefix(prefix_trim).unwrap_or(key);
                (key.to_string(), info.value.clone())
            })
            .collect()
    }
}

impl Deref for KeyInfoMap {
    type Target = BTreeMap<String, KeyInfo>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for KeyInfoMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<KeyInfo> for KeyInfoMap {
    fn from_iter<I: IntoIterator<Item = KeyInfo>>(iter: I) -> Self {
        Self(iter.into_iter().map(|info| (info.key.clone(), info)).collect())
    }
}

/// Result of a range read: the matching keys and the store revision the read
/// was served at.
#[derive(Debug, Clone, Default)]
pub struct KeyRangeInfo {
    pub keys: KeyInfoMap,
    pub revision: i64,
}

impl Client {
    /// Read every key in `[start, end)`. No match yields an empty map.
    pub async fn get_key_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> KvResult<KeyRangeInfo> {
        let (start, end) = (start.as_ref(), end.as_ref());
        let resp = self
            .call("get_key_range", |store| store.range(start, Some(end), None))
            .await?;
        Ok(KeyRangeInfo {
            keys: resp.kvs.into_iter().map(KeyInfo::from).collect(),
            revision: resp.revision,
        })
    }

    /// Delete every key in `[start, end)`.
    pub async fn delete_key_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> KvResult<()> {
        let (start, end) = (start.as_ref(), end.as_ref());
        self.call("delete_key_range", |store| {
            store.delete_range(start, Some(end))
        })
        .await?;
        Ok(())
    }

    /// Read every key starting with `prefix`.
    pub async fn get_prefix(&self, prefix: &str) -> KvResult<KeyRangeInfo> {
        self.get_key_range(prefix, prefix_range_end(prefix.as_bytes()))
            .await
    }

    /// Delete every key starting with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> KvResult<()> {
        self.delete_key_range(prefix, prefix_range_end(prefix.as_bytes()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(key: &str, value: &str) -> KeyInfo {
        KeyInfo {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            version: 1,
            create_revision: 2,
            mod_revision: 2,
            lease: 0,
        }
    }

    #[test]
    fn to_value_map_trims_prefix() {
        let map: KeyInfoMap = vec![info("/cfg/a", "1"), info("/cfg/b/c", "2")]
            .into_iter()
            .collect();
        let values = map.to_value_map("/cfg/");
        assert_eq!(values.get("a"), Some(&b"1".to_vec()));
        assert_eq!(values.get("b/c"), Some(&b"2".to_vec()));
        assert_eq!(values.len(), 2);
    }
}
