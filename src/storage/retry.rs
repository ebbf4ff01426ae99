//! Bounded retry around a storage backend
//!
//! Every call runs under a timeout and is repeated a fixed number of times on
//! transient failures. When the budget is spent the last error is returned so
//! callers can surface a retryable failure to the client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{Storage, StorageError};

/// Attempts and per-attempt timeout
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(30),
            backoff: Duration::from_millis(50),
        }
    }
}

/// Storage wrapper applying a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryingStorage {
    inner: Arc<dyn Storage>,
    policy: RetryPolicy,
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn attempt<T, F, Fut>(&self, op: &str, path: &str, mut call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = StorageError::Io(format!("{} {}: no attempts made", op, path));

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(self.policy.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(format!(
                    "{} {} after {:?}",
                    op, path, self.policy.timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(
                        op = op,
                        path = %path,
                        attempt = attempt,
                        error = %e,
                        "Storage call failed, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    last_error = e;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(op = op, path = %path, attempts = attempts, error = %e, "Storage retries exhausted");
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.attempt("write", path, move || inner.write(path, bytes)).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let inner = &self.inner;
        self.attempt("read", path, move || inner.read(path)).await
    }

    /// Not idempotent, so only the timeout applies
    async fn append(&self, path: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        match tokio::time::timeout(self.policy.timeout, self.inner.append(path, bytes)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!(
                "append {} after {:?}",
                path, self.policy.timeout
            ))),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.attempt("rename", from, move || inner.rename(from, to)).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.attempt("delete", path, move || inner.delete(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let inner = &self.inner;
        self.attempt("exists", path, move || inner.exists(path)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let inner = &self.inner;
        self.attempt("delete_prefix", prefix, move || inner.delete_prefix(prefix))
            .await
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let inner = &self.inner;
        self.attempt("list_children", prefix, move || inner.list_children(prefix))
            .await
    }
}
