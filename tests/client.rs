//! Key, range and watch operation tests.

mod common;

use common::memory_client;
use etcdkit::backend::memory::{BackendOp, FaultKind};
use etcdkit::backend::{CompareOp, KvBackend, TxnOp, TxnRequest};
use etcdkit::client::conditions::{key_present, value_cmp, version_cmp};
use etcdkit::{ErrorKind, WatchOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Key tests
// ============================================================================

#[tokio::test]
async fn get_missing_key_is_none_not_error() {
    let (client, _) = memory_client();
    assert!(client.get_key("/nope").await.unwrap().is_none());
}

#[tokio::test]
async fn put_get_delete_round() {
    let (client, _) = memory_client();
    let revision = client.put_key("/k", "hello").await.unwrap();

    let info = client.get_key("/k").await.unwrap().unwrap();
    assert_eq!(info.key, "/k");
    assert_eq!(info.value_str(), "hello");
    assert_eq!(info.version, 1);
    assert_eq!(info.create_revision, revision);
    assert_eq!(info.mod_revision, revision);
    assert_eq!(info.lease, 0);

    client.delete_key("/k").await.unwrap();
    assert!(client.get_key("/k").await.unwrap().is_none());
    client.delete_key("/k").await.unwrap();
}

#[tokio::test]
async fn get_at_revision_reads_snapshot() {
    let (client, _) = memory_client();
    let first = client.put_key("/k", "v1").await.unwrap();
    client.put_key("/k", "v2").await.unwrap();

    let old = client.get_key_at_revision("/k", first).await.unwrap().unwrap();
    assert_eq!(old.value, b"v1".to_vec());
    let current = client.get_key("/k").await.unwrap().unwrap();
    assert_eq!(current.value, b"v2".to_vec());
    assert_eq!(current.version, 2);
}

// ============================================================================
// Range tests
// ============================================================================

#[tokio::test]
async fn empty_range_is_empty_map() {
    let (client, _) = memory_client();
    let range = client.get_key_range("/a", "/b").await.unwrap();
    assert!(range.keys.is_empty());
    assert!(range.revision > 0);
}

#[tokio::test]
async fn range_is_half_open() {
    let (client, _) = memory_client();
    for key in ["/r/a", "/r/b", "/r/c"] {
        client.put_key(key, "v").await.unwrap();
    }
    let range = client.get_key_range("/r/a", "/r/c").await.unwrap();
    assert_eq!(
        range.keys.keys().cloned().collect::<Vec<_>>(),
        vec!["/r/a".to_string(), "/r/b".to_string()]
    );

    client.delete_key_range("/r/a", "/r/c").await.unwrap();
    let left = client.get_prefix("/r/").await.unwrap();
    assert_eq!(left.keys.len(), 1);
    assert!(left.keys.contains_key("/r/c"));
}

#[tokio::test]
async fn prefix_operations_stay_within_prefix() {
    let (client, _) = memory_client();
    client.put_key("/app/x", "1").await.unwrap();
    client.put_key("/app/y", "2").await.unwrap();
    client.put_key("/apple", "3").await.unwrap();

    let range = client.get_prefix("/app/").await.unwrap();
    let values = range.keys.to_value_map("/app/");
    assert_eq!(values, common::values(&[("x", "1"), ("y", "2")]));

    client.delete_prefix("/app/").await.unwrap();
    assert!(client.get_prefix("/app/").await.unwrap().keys.is_empty());
    assert!(client.get_key("/apple").await.unwrap().is_some());
}

#[tokio::test]
async fn range_reads_retry_through_transient_errors() {
    let (client, backend) = memory_client();
    client.put_key("/p/a", "1").await.unwrap();
    backend.fail_next(Some(BackendOp::Range), 3, FaultKind::Unavailable);

    let range = client.get_prefix("/p/").await.unwrap();
    assert_eq!(range.keys.len(), 1);
    assert_eq!(backend.call_count(BackendOp::Range), 4);
}

// ============================================================================
// Condition tests
// ============================================================================

#[tokio::test]
async fn conditions_guard_transactions() {
    let (client, backend) = memory_client();
    client.put_key("/cfg", "v1").await.unwrap();

    let guarded = TxnRequest::when(
        vec![
            key_present("/cfg", true),
            value_cmp("/cfg", CompareOp::Equal, "v1"),
            version_cmp("/cfg", CompareOp::Equal, 1),
        ],
        vec![TxnOp::put("/cfg", "v2")],
    );
    assert!(backend.txn(guarded.clone()).await.unwrap().succeeded);
    assert!(!backend.txn(guarded).await.unwrap().succeeded);

    let absent = TxnRequest::when(vec![key_present("/new", false)], vec![TxnOp::put("/new", "x")]);
    assert!(backend.txn(absent).await.unwrap().succeeded);
    assert_eq!(client.get_key("/cfg").await.unwrap().unwrap().value, b"v2".to_vec());
}

// ============================================================================
// Watch tests
// ============================================================================

#[tokio::test]
async fn watch_reports_upserts_and_deletions_in_order() {
    let (client, _) = memory_client();
    let cancel = CancellationToken::new();
    let start = client.put_key("/w/a", "1").await.unwrap();
    client.put_key("/w/b", "2").await.unwrap();
    client.delete_key("/w/a").await.unwrap();

    let mut rx = client.watch(
        "/w/",
        WatchOptions {
            revision: start,
            is_prefix: true,
            trim_prefix: true,
        },
        cancel.clone(),
    );

    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first.upserts["a"].value, b"1".to_vec());
    let second = rx.recv().await.unwrap().unwrap();
    assert!(second.upserts.contains_key("b"));
    let third = rx.recv().await.unwrap().unwrap();
    assert_eq!(third.deletions, vec!["a".to_string()]);
    assert!(third.upserts.is_empty());

    client.put_key("/w/c", "3").await.unwrap();
    let live = rx.recv().await.unwrap().unwrap();
    assert_eq!(live.upserts["c"].version, 1);

    cancel.cancel();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn watch_single_key_ignores_neighbours() {
    let (client, _) = memory_client();
    let cancel = CancellationToken::new();
    let mut rx = client.watch("/only", WatchOptions::default(), cancel.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.put_key("/only2", "x").await.unwrap();
    client.put_key("/only", "y").await.unwrap();

    let info = rx.recv().await.unwrap().unwrap();
    assert_eq!(info.upserts.len(), 1);
    assert!(info.upserts.contains_key("/only"));
    cancel.cancel();
}

#[tokio::test]
async fn cancelled_watch_delivers_nothing_more() {
    let (client, backend) = memory_client();
    let cancel = CancellationToken::new();
    let mut rx = client.watch(
        "/c/",
        WatchOptions {
            is_prefix: true,
            trim_prefix: true,
            ..WatchOptions::default()
        },
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.call_count(BackendOp::Watch), 1);

    client.put_key("/c/a", "1").await.unwrap();
    let first = rx.recv().await.unwrap().unwrap();
    assert!(first.upserts.contains_key("a"));

    cancel.cancel();
    client.put_key("/c/b", "2").await.unwrap();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn watch_cancelled_before_start_closes_channel() {
    let (client, backend) = memory_client();
    let cancel = CancellationToken::new();
    let mut rx = client.watch(
        "/c/",
        WatchOptions {
            is_prefix: true,
            ..WatchOptions::default()
        },
        cancel.clone(),
    );
    cancel.cancel();
    client.put_key("/c/a", "1").await.unwrap();
    assert!(rx.recv().await.is_none());
    assert_eq!(backend.call_count(BackendOp::Watch), 0);
}

#[tokio::test]
async fn watch_error_is_terminal() {
    let (client, backend) = memory_client();
    let first = client.put_key("/h/a", "1").await.unwrap();
    let latest = client.put_key("/h/a", "2").await.unwrap();
    backend.compact(latest);

    let mut rx = client.watch(
        "/h/",
        WatchOptions {
            revision: first,
            is_prefix: true,
            trim_prefix: false,
        },
        CancellationToken::new(),
    );
    let err = rx.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn watch_establishment_failure_is_reported() {
    let (client, backend) = memory_client();
    backend.fail_always(Some(BackendOp::Watch), FaultKind::Fatal);

    let mut rx = client.watch("/x", WatchOptions::default(), CancellationToken::new());
    let err = rx.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn watch_prefix_changes_reports_relative_diffs() {
    let (client, _) = memory_client();
    let cancel = CancellationToken::new();
    let start = client.put_key("/d/a", "1").await.unwrap();
    client.put_key("/d/a", "2").await.unwrap();
    client.delete_key("/d/a").await.unwrap();

    let mut rx = client.watch_prefix_changes("/d/", start, cancel.clone());
    let created = rx.recv().await.unwrap().unwrap();
    assert_eq!(created.inserts.get("a"), Some(&b"1".to_vec()));
    let updated = rx.recv().await.unwrap().unwrap();
    assert_eq!(updated.updates.get("a"), Some(&b"2".to_vec()));
    let deleted = rx.recv().await.unwrap().unwrap();
    assert!(deleted.deletions.contains("a"));

    cancel.cancel();
    assert!(rx.recv().await.is_none());
}
