//! Retry governor.
//!
//! Every remote call goes through [`RetryPolicy::run`]: execute once with the
//! per-call timeout; on a retriable failure sleep a fixed interval and try
//! again while budget remains. Fatal errors and the error that exhausts the
//! budget are returned unchanged. No jitter is added.
//!
//! The loop is iterative so retry depth never grows the stack.

use crate::core::error::{KvError, KvResult};
use std::future::Future;
use std::time::Duration;

/// Retry budget, retry interval and per-call timeout held by a client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u64,
    /// Fixed sleep between attempts.
    pub retry_interval: Duration,
    /// Timeout for each individual attempt.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(retries: u64, retry_interval: Duration, request_timeout: Duration) -> Self {
        Self {
            retries,
            retry_interval,
            request_timeout,
        }
    }

    /// Start a fresh budget for a multi-step operation that manages its own
    /// attempts.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            remaining: self.retries,
            interval: self.retry_interval,
        }
    }

    /// Run a single attempt bounded by the per-call timeout.
    pub async fn attempt<T, Fut>(&self, fut: Fut) -> KvResult<T>
    where
        Fut: Future<Output = KvResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(KvError::RequestTimeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> KvResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let mut budget = self.budget();
        loop {
            match self.attempt(op()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !budget.consume(operation, &err) {
                        return Err(err);
                    }
                    budget.wait().await;
                }
            }
        }
    }
}

/// Remaining retries of one logical operation.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    remaining: u64,
    interval: Duration,
}

impl RetryBudget {
    /// Retries left.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Decide whether `err` should be retried, spending one unit if so.
    pub fn consume(&mut self, operation: &'static str, err: &KvError) -> bool {
        if self.remaining == 0 || !err.is_retriable() {
            return false;
        }
        self.remaining -= 1;
        tracing::warn!(
            operation,
            remaining = self.remaining,
            error = %err,
            "retrying after transient store error"
        );
        true
    }

    /// Sleep the fixed retry interval.
    pub async fn wait(&self) {
        tokio::time::sleep(self.interval).await;
    }
}
