//! Chunked keys: values of unbounded size stored as versioned chunk sets.
//!
//! Layout for a logical key `K`:
//!
//! ```text
//! K/info                      {"Size":..,"Count":..,"Version":..}
//! K/chunks/v<version>/<index> chunk bytes, index from 0
//! ```
//!
//! Writes put every chunk of version `v+1` individually, then advance `K/info`
//! and drop the `v` chunk set in one transaction. Before writing, any residue
//! under `v+1` from an aborted write is cleared. Readers capture the info and
//! the store revision once and read every chunk at that revision, so a
//! concurrent writer can never produce a torn read.
//!
//! Orphans from two or more successive aborted writes at versions above `v+1`
//! are not cleaned up. Concurrent writers to one chunked key are unsupported:
//! the commit is unconditional, so both report success at the same version
//! and the last commit wins.

use crate::backend::{prefix_range_end, TxnOp, TxnRequest};
use crate::client::Client;
use crate::core::error::{KvError, KvResult};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Metadata record of a chunked key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkedKeyInfo {
    /// Total size in bytes.
    pub size: i64,
    /// Number of chunks, `ceil(size / chunk_size)`.
    pub count: i64,
    /// Live chunk set version.
    pub version: i64,
}

/// Chunk info together with the revision it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedKeySnapshot {
    pub info: ChunkedKeyInfo,
    pub revision: i64,
}

fn info_key(key: &str) -> String {
    format!("{}/info", key)
}

fn chunks_prefix(key: &str) -> String {
    format!("{}/chunks/", key)
}

fn version_prefix(key: &str, version: i64) -> String {
    format!("{}/chunks/v{}/", key, version)
}

fn chunk_key(key: &str, version: i64, index: i64) -> String {
    format!("{}/chunks/v{}/{}", key, version, index)
}

fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size / chunk_size + u64::from(size % chunk_size > 0)
}

impl Client {
    /// Read the info record of a chunked key, if any.
    pub async fn get_chunked_key_info(&self, key: &str) -> KvResult<Option<ChunkedKeySnapshot>> {
        let info_key = info_key(key);
        let resp = self
            .call("get_chunked_key_info", |store| {
                store.range(info_key.as_bytes(), None, None)
            })
            .await?;
        let Some(kv) = resp.kvs.first() else {
            return Ok(None);
        };
        let info: ChunkedKeyInfo = serde_json::from_slice(&kv.value)?;
        Ok(Some(ChunkedKeySnapshot {
            info,
            revision: resp.revision,
        }))
    }

    /// Store `size` bytes read from `value` under `key`.
    ///
    /// Either the whole new version becomes live or the previous one stays
    /// intact.
    pub async fn put_chunked_key<R>(&self, key: &str, size: u64, value: R) -> KvResult<ChunkedKeyInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut value = value;
        let chunk_size = self.config().chunking.chunk_size as u64;
        let version = self
            .get_chunked_key_info(key)
            .await?
            .map_or(0, |snapshot| snapshot.info.version);
        let next = version + 1;

        self.delete_prefix(&version_prefix(key, next)).await?;

        let count = chunk_count(size, chunk_size);
        let mut buf = vec![0u8; chunk_size.min(size) as usize];
        for index in 0..count {
            let len = chunk_size.min(size - index * chunk_size) as usize;
            value.read_exact(&mut buf[..len]).await?;
            self.put_key(&chunk_key(key, next, index as i64), &buf[..len])
                .await?;
            tracing::debug!(key, version = next, index, count, "chunk written");
        }

        let info = ChunkedKeyInfo {
            size: size as i64,
            count: count as i64,
            version: next,
        };
        let payload = serde_json::to_vec(&info)?;
        let previous = version_prefix(key, version);
        let ops = vec![
            TxnOp::put(info_key(key), payload),
            TxnOp::delete_range(previous.clone(), prefix_range_end(previous.as_bytes())),
        ];
        let resp = self
            .call("put_chunked_key_info", |store| {
                store.txn(TxnRequest::then(ops.clone()))
            })
            .await?;
        if !resp.succeeded {
            return Err(KvError::txn_failed(format!("advancing {} to version {}", key, next)));
        }
        tracing::debug!(key, version = next, size, revision = resp.revision, "chunked key committed");
        Ok(info)
    }

    /// Store an in-memory value under `key`.
    pub async fn put_chunked_bytes(&self, key: &str, value: &[u8]) -> KvResult<ChunkedKeyInfo> {
        self.put_chunked_key(key, value.len() as u64, value).await
    }

    /// Open a revision-pinned reader over `key`, or `None` if it has no info
    /// record.
    pub async fn get_chunked_key(&self, key: &str) -> KvResult<Option<ChunksReader>> {
        Ok(self
            .get_chunked_key_info(key)
            .await?
            .map(|snapshot| ChunksReader::new(self.clone(), key, snapshot)))
    }

    /// Remove the info record and every chunk version in one transaction.
    pub async fn delete_chunked_key(&self, key: &str) -> KvResult<()> {
        let chunks = chunks_prefix(key);
        let ops = vec![
            TxnOp::delete(info_key(key)),
            TxnOp::delete_range(chunks.clone(), prefix_range_end(chunks.as_bytes())),
        ];
        self.call("delete_chunked_key", |store| {
            store.txn(TxnRequest::then(ops.clone()))
        })
        .await?;
        Ok(())
    }
}

type ChunkFetch = Pin<Box<dyn Future<Output = KvResult<Bytes>> + Send>>;

/// Lazy reader over the chunks of one version, pinned to one revision.
///
/// Also an [`AsyncRead`], so it can feed `tokio::io::copy` or another
/// [`Client::put_chunked_key`]. Errors surface there as `io::Error`s wrapping
/// the [`KvError`].
pub struct ChunksReader {
    client: Client,
    key: String,
    snapshot: ChunkedKeySnapshot,
    next_index: i64,
    buffer: Bytes,
    pending: Option<ChunkFetch>,
}

impl ChunksReader {
    fn new(client: Client, key: &str, snapshot: ChunkedKeySnapshot) -> Self {
        Self {
            client,
            key: key.to_string(),
            snapshot,
            next_index: 0,
            buffer: Bytes::new(),
            pending: None,
        }
    }

    fn fetch_next(&self) -> ChunkFetch {
        let client = self.client.clone();
        let key = chunk_key(&self.key, self.snapshot.info.version, self.next_index);
        let revision = self.snapshot.revision;
        Box::pin(async move {
            let chunk = client.get_key_at_revision(&key, revision).await?;
            match chunk {
                Some(chunk) => Ok(Bytes::from(chunk.value)),
                None => Err(KvError::ChunkMissing { key, revision }),
            }
        })
    }

    /// Info and revision the reader is pinned to.
    pub fn snapshot(&self) -> ChunkedKeySnapshot {
        self.snapshot
    }

    /// Total size of the value.
    pub fn size(&self) -> i64 {
        self.snapshot.info.size
    }

    /// Fetch the next chunk, or `None` after the last one.
    ///
    /// A chunk missing at the pinned revision is a consistency error.
    pub async fn next_chunk(&mut self) -> KvResult<Option<Bytes>> {
        if self.next_index >= self.snapshot.info.count {
            return Ok(None);
        }
        let fetch = match self.pending.take() {
            Some(fetch) => fetch,
            None => self.fetch_next(),
        };
        let chunk = fetch.await?;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Read into `buf`, returning the number of bytes copied; 0 at the end.
    pub async fn read(&mut self, buf: &mut [u8]) -> KvResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.buffer.has_remaining() {
            match self.next_chunk().await? {
                Some(chunk) => self.buffer = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffer.remaining());
        self.buffer.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }

    /// Read every remaining byte.
    pub async fn read_to_end(mut self) -> KvResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.snapshot.info.size.max(0) as usize);
        out.extend_from_slice(&self.buffer);
        self.buffer.clear();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl AsyncRead for ChunksReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while !this.buffer.has_remaining() {
            if this.next_index >= this.snapshot.info.count {
                return Poll::Ready(Ok(()));
            }
            let mut fetch = match this.pending.take() {
                Some(fetch) => fetch,
                None => this.fetch_next(),
            };
            let Poll::Ready(result) = fetch.as_mut().poll(cx) else {
                this.pending = Some(fetch);
                return Poll::Pending;
            };
            match result {
                Ok(chunk) => {
                    this.next_index += 1;
                    this.buffer = chunk;
                }
                Err(err) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err))),
            }
        }
        let n = buf.remaining().min(this.buffer.remaining());
        buf.put_slice(&this.buffer[..n]);
        this.buffer.advance(n);
        Poll::Ready(Ok(()))
    }
}
