//! Configuration parsing and validation.
//!
//! Client configuration is loaded from TOML. Every section has defaults, so an
//! empty document yields a usable configuration for the in-memory backend.

use crate::core::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Store endpoints (consumed by the etcd backend).
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Retry governor settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Connection settings passed through to the driver.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Chunked key store settings.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Distributed lock defaults.
    #[serde(default)]
    pub lock: LockConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
            chunking: ChunkingConfig::default(),
            lock: LockConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Retry governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: u64,

    /// Fixed sleep between attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Timeout applied to each individual remote call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Dial timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Username for password authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for password authentication.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            username: None,
            password: None,
        }
    }
}

/// Chunked key store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum size of a single chunk record in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Distributed lock defaults, used when acquire options leave a field at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL in seconds.
    #[serde(default = "default_lock_ttl_seconds")]
    pub default_ttl_seconds: i64,

    /// Acquisition timeout in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Wait between contended attempts in milliseconds.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub default_retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_lock_ttl_seconds(),
            default_timeout_ms: default_lock_timeout_ms(),
            default_retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_retries() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_lock_ttl_seconds() -> i64 {
    600
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_retry_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy derived from the `[retry]` section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retry.retries,
            retry_interval: Duration::from_millis(self.retry.retry_interval_ms),
            request_timeout: Duration::from_millis(self.retry.request_timeout_ms),
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_retry()?;
        self.validate_chunking()?;
        self.validate_lock()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_retry(&self) -> Result<()> {
        if self.retry.retry_interval_ms == 0 {
            anyhow::bail!("retry.retry_interval_ms must be > 0");
        }
        if self.retry.request_timeout_ms == 0 {
            anyhow::bail!("retry.request_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_chunking(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        Ok(())
    }

    fn validate_lock(&self) -> Result<()> {
        if self.lock.default_ttl_seconds <= 0 {
            anyhow::bail!(
                "lock.default_ttl_seconds must be > 0, got: {}",
                self.lock.default_ttl_seconds
            );
        }
        if self.lock.default_timeout_ms == 0 {
            anyhow::bail!("lock.default_timeout_ms must be > 0");
        }
        if self.lock.default_retry_interval_ms == 0 {
            anyhow::bail!("lock.default_retry_interval_ms must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}
