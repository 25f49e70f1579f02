//! Chunked key store tests.

mod common;

use common::{memory_client, payload, TEST_CHUNK_SIZE};
use etcdkit::backend::memory::{BackendOp, FaultKind};
use etcdkit::{ErrorKind, KvError};
use tokio::io::AsyncReadExt;

// ============================================================================
// Round-trip tests
// ============================================================================

#[tokio::test]
async fn round_trip_at_chunk_boundaries() {
    let (client, _) = memory_client();
    let sizes = [
        0,
        1,
        TEST_CHUNK_SIZE - 1,
        TEST_CHUNK_SIZE,
        TEST_CHUNK_SIZE + 1,
        TEST_CHUNK_SIZE * 5 + 3,
    ];
    for (i, size) in sizes.into_iter().enumerate() {
        let key = format!("/blob{}", i);
        let data = payload(size);
        let info = client.put_chunked_bytes(&key, &data).await.unwrap();
        assert_eq!(info.size, size as i64);
        assert_eq!(info.count, ((size + TEST_CHUNK_SIZE - 1) / TEST_CHUNK_SIZE) as i64);
        assert_eq!(info.version, 1);

        let reader = client.get_chunked_key(&key).await.unwrap().unwrap();
        assert_eq!(reader.size(), size as i64);
        assert_eq!(reader.read_to_end().await.unwrap(), data, "size {}", size);
    }
}

#[tokio::test]
async fn streaming_read_with_small_buffer() {
    let (client, _) = memory_client();
    let data = payload(TEST_CHUNK_SIZE * 3 + 2);
    client.put_chunked_bytes("/stream", &data).await.unwrap();

    let mut reader = client.get_chunked_key("/stream").await.unwrap().unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, data);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn put_from_async_reader() {
    let (client, _) = memory_client();
    let data = payload(20);
    let info = client
        .put_chunked_key("/reader", data.len() as u64, &data[..])
        .await
        .unwrap();
    assert_eq!(info.count, 3);
    let back = client.get_chunked_key("/reader").await.unwrap().unwrap();
    assert_eq!(back.read_to_end().await.unwrap(), data);
}

#[tokio::test]
async fn short_source_aborts_without_visible_change() {
    let (client, _) = memory_client();
    client.put_chunked_bytes("/short", b"original").await.unwrap();

    let err = client
        .put_chunked_key("/short", 50, &b"too short"[..])
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::Io(_)));

    let reader = client.get_chunked_key("/short").await.unwrap().unwrap();
    assert_eq!(reader.snapshot().info.version, 1);
    assert_eq!(reader.read_to_end().await.unwrap(), b"original".to_vec());
}

#[tokio::test]
async fn reader_streams_through_tokio_io() {
    let (client, _) = memory_client();
    let data = payload(TEST_CHUNK_SIZE * 4 + 5);
    client.put_chunked_bytes("/src", &data).await.unwrap();

    let mut reader = client.get_chunked_key("/src").await.unwrap().unwrap();
    let mut out = Vec::new();
    let copied = tokio::io::copy(&mut reader, &mut out).await.unwrap();
    assert_eq!(copied, data.len() as u64);
    assert_eq!(out, data);
}

#[tokio::test]
async fn reader_feeds_another_chunked_write() {
    let (client, _) = memory_client();
    let data = payload(TEST_CHUNK_SIZE * 2 + 1);
    client.put_chunked_bytes("/from", &data).await.unwrap();

    let reader = client.get_chunked_key("/from").await.unwrap().unwrap();
    let size = reader.size() as u64;
    let info = client.put_chunked_key("/to", size, reader).await.unwrap();
    assert_eq!(info.count, 3);

    let copy = client.get_chunked_key("/to").await.unwrap().unwrap();
    assert_eq!(copy.read_to_end().await.unwrap(), data);
}

#[tokio::test]
async fn missing_chunk_surfaces_as_io_error() {
    let (client, _) = memory_client();
    client.put_chunked_bytes("/hole", &payload(20)).await.unwrap();
    client.delete_key("/hole/chunks/v1/2").await.unwrap();

    let mut reader = client.get_chunked_key("/hole").await.unwrap().unwrap();
    let mut out = Vec::new();
    let err = AsyncReadExt::read_to_end(&mut reader, &mut out)
        .await
        .unwrap_err();
    assert_eq!(out, payload(16));
    let cause = err.get_ref().and_then(|e| e.downcast_ref::<KvError>()).unwrap();
    assert!(matches!(cause, KvError::ChunkMissing { .. }));
}

#[tokio::test]
async fn missing_key_has_no_reader() {
    let (client, _) = memory_client();
    assert!(client.get_chunked_key("/absent").await.unwrap().is_none());
}

// ============================================================================
// Versioning tests
// ============================================================================

#[tokio::test]
async fn new_version_replaces_previous_chunk_set() {
    let (client, _) = memory_client();
    client.put_chunked_bytes("/v", &payload(20)).await.unwrap();
    let info = client.put_chunked_bytes("/v", &payload(9)).await.unwrap();
    assert_eq!(info.version, 2);

    assert!(client.get_prefix("/v/chunks/v1/").await.unwrap().keys.is_empty());
    let live = client.get_prefix("/v/chunks/v2/").await.unwrap();
    assert_eq!(live.keys.len(), 2);
    assert!(live.keys.contains_key("/v/chunks/v2/0"));
    assert!(live.keys.contains_key("/v/chunks/v2/1"));

    let stored = client.get_key("/v/info").await.unwrap().unwrap();
    assert_eq!(stored.value_str(), r#"{"Size":9,"Count":2,"Version":2}"#);
}

#[tokio::test]
async fn reader_pinned_to_revision_never_mixes_versions() {
    let (client, _) = memory_client();
    let old = vec![b'o'; TEST_CHUNK_SIZE * 3];
    let new = vec![b'n'; TEST_CHUNK_SIZE * 4];
    client.put_chunked_bytes("/pin", &old).await.unwrap();

    let mut reader = client.get_chunked_key("/pin").await.unwrap().unwrap();
    let first = reader.next_chunk().await.unwrap().unwrap();
    assert_eq!(&first[..], &old[..TEST_CHUNK_SIZE]);

    // A writer advances the key mid-read and drops the old chunk set.
    client.put_chunked_bytes("/pin", &new).await.unwrap();

    let mut rest = Vec::new();
    while let Some(chunk) = reader.next_chunk().await.unwrap() {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, old[TEST_CHUNK_SIZE..].to_vec());

    let fresh = client.get_chunked_key("/pin").await.unwrap().unwrap();
    assert_eq!(fresh.read_to_end().await.unwrap(), new);
}

#[tokio::test]
async fn aborted_commit_leaves_previous_version_live() {
    let (client, backend) = memory_client();
    let old = payload(12);
    client.put_chunked_bytes("/abort", &old).await.unwrap();

    backend.fail_next(Some(BackendOp::Txn), 1, FaultKind::Fatal);
    let err = client
        .put_chunked_bytes("/abort", &payload(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    // Orphans of the aborted write sit at the next version.
    assert_eq!(client.get_prefix("/abort/chunks/v2/").await.unwrap().keys.len(), 4);
    let reader = client.get_chunked_key("/abort").await.unwrap().unwrap();
    assert_eq!(reader.snapshot().info.version, 1);
    assert_eq!(reader.read_to_end().await.unwrap(), old);

    // The next write clears the residue before reusing the version.
    let info = client.put_chunked_bytes("/abort", &payload(3)).await.unwrap();
    assert_eq!(info.version, 2);
    let live = client.get_prefix("/abort/chunks/v2/").await.unwrap();
    assert_eq!(live.keys.len(), 1);
    assert!(client.get_prefix("/abort/chunks/v1/").await.unwrap().keys.is_empty());
}

#[tokio::test]
async fn residue_at_next_version_is_cleared_before_write() {
    let (client, _) = memory_client();
    client.put_chunked_bytes("/res", &payload(4)).await.unwrap();
    client.put_key("/res/chunks/v2/7", "stale").await.unwrap();

    client.put_chunked_bytes("/res", &payload(4)).await.unwrap();
    assert!(client.get_key("/res/chunks/v2/7").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_chunk_is_a_consistency_error() {
    let (client, _) = memory_client();
    client.put_chunked_bytes("/broken", &payload(20)).await.unwrap();
    client.delete_key("/broken/chunks/v1/1").await.unwrap();

    let reader = client.get_chunked_key("/broken").await.unwrap().unwrap();
    let revision = reader.snapshot().revision;
    let err = reader.read_to_end().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_eq!(
        err.to_string(),
        format!("/broken/chunks/v1/1 chunk key not found at revision {}", revision)
    );
}

#[tokio::test]
async fn chunk_writes_retry_independently() {
    let (client, backend) = memory_client();
    backend.fail_next(Some(BackendOp::Put), 2, FaultKind::Unavailable);
    let data = payload(TEST_CHUNK_SIZE * 2);
    client.put_chunked_bytes("/flaky", &data).await.unwrap();
    assert_eq!(backend.call_count(BackendOp::Put), 4);

    let reader = client.get_chunked_key("/flaky").await.unwrap().unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
}

// ============================================================================
// Delete tests
// ============================================================================

#[tokio::test]
async fn delete_removes_info_and_every_version() {
    let (client, backend) = memory_client();
    client.put_chunked_bytes("/gone", &payload(10)).await.unwrap();
    client.put_key("/gone/chunks/v5/0", "orphan").await.unwrap();
    client.put_key("/gone-neighbour", "keep").await.unwrap();

    let before = backend.call_count(BackendOp::Txn);
    client.delete_chunked_key("/gone").await.unwrap();
    assert_eq!(backend.call_count(BackendOp::Txn), before + 1);

    assert!(client.get_prefix("/gone/").await.unwrap().keys.is_empty());
    assert!(client.get_chunked_key("/gone").await.unwrap().is_none());
    assert!(client.get_key("/gone-neighbour").await.unwrap().is_some());
}
