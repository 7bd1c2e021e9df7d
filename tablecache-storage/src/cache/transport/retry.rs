//! Bounded retry for transient transport failures.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tablecache_core::TransportError;

use super::{CacheTransport, Transaction, VersionToken};

/// Decorator that retries operations failing with a transient error.
///
/// Conflicts are booleans, not errors, so they pass straight through. A
/// retried `add_if_absent` whose first attempt landed reports `false`.
/// `hash_increment_field` is never retried: a timeout may hide an applied
/// increment.
pub struct RetryingTransport<T> {
    inner: T,
    attempts: usize,
}

impl<T: CacheTransport> RetryingTransport<T> {
    pub fn new(inner: T, attempts: usize) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn retry<R, F, Fut>(&self, operation: &str, mut f: F) -> Result<R, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::debug!(
                        operation,
                        attempt,
                        error = %e,
                        "Transient transport failure, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<T: CacheTransport> CacheTransport for RetryingTransport<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.retry("get", || self.inner.get(key)).await
    }

    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError> {
        self.retry("get_with_version", || self.inner.get_with_version(key))
            .await
    }

    async fn add_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, TransportError> {
        self.retry("add_if_absent", || self.inner.add_if_absent(key, value, ttl))
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, TransportError> {
        self.retry("set", || self.inner.set(key, value, ttl)).await
    }

    async fn replace_if_version_matches(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        token: VersionToken,
    ) -> Result<bool, TransportError> {
        self.retry("replace_if_version_matches", || {
            self.inner.replace_if_version_matches(key, value, ttl, token)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, TransportError> {
        self.retry("remove", || self.inner.remove(key)).await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError> {
        self.retry("remove_many", || self.inner.remove_many(keys)).await
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        self.retry("hash_set", || self.inner.hash_set(key, field, value, ttl))
            .await
    }

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        self.retry("hash_remove_field", || self.inner.hash_remove_field(key, field))
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError> {
        self.retry("hash_get_all", || self.inner.hash_get_all(key)).await
    }

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        self.retry("hash_field_exists", || self.inner.hash_field_exists(key, field))
            .await
    }

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError> {
        self.retry("hash_length", || self.inner.hash_length(key)).await
    }

    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError> {
        self.inner.hash_increment_field(key, field, delta).await
    }

    fn begin_transaction(&self) -> Transaction {
        self.inner.begin_transaction()
    }

    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError> {
        self.retry("execute", || self.inner.execute(transaction.clone()))
            .await
    }

    fn key_length_limit(&self) -> usize {
        self.inner.key_length_limit()
    }
}
