//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use etcdkit::backend::memory::MemoryBackend;
use etcdkit::{Client, ClientConfig, ValueMap};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Chunk size used by [`memory_client`], small enough to exercise splitting.
pub const TEST_CHUNK_SIZE: usize = 8;

/// Configuration with a short retry interval and a tiny chunk size.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.retry.retries = 3;
    config.retry.retry_interval_ms = 1;
    config.retry.request_timeout_ms = 1_000;
    config.chunking.chunk_size = TEST_CHUNK_SIZE;
    config.lock.default_retry_interval_ms = 10;
    config
}

/// Client over a fresh in-memory store.
pub fn memory_client() -> (Client, Arc<MemoryBackend>) {
    Client::in_memory(test_config())
}

/// Client over an in-memory store simulating a cluster with the named members.
pub fn cluster_client(names: &[&str]) -> (Client, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::with_members(names));
    (Client::new(backend.clone(), test_config()), backend)
}

/// Write `content` to a temporary config file.
pub fn create_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Build a value map from string pairs.
pub fn values(pairs: &[(&str, &str)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
