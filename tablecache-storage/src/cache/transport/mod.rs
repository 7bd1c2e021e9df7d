//! Cache transport contract.
//!
//! The engine talks to the shared remote cache only through
//! [`CacheTransport`]: plain and versioned values, hash entries, and
//! all-or-nothing transactions guarded by preconditions. Optimistic conflicts
//! are reported as `false`/`None`, never as errors.
//!
//! A zero TTL means the entry never expires.

pub mod lmdb;
pub mod memory;
pub mod retry;

pub use lmdb::{LmdbTransport, LmdbTransportError};
pub use memory::HashMapTransport;
pub use retry::RetryingTransport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tablecache_core::TransportError;

/// Default maximum cache key length.
pub const DEFAULT_KEY_LENGTH_LIMIT: usize = 250;

/// Opaque version of a cache entry.
///
/// Versions come from a store-wide monotonic sequence, so a key that is
/// removed and recreated never shows a token it had before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionToken(u64);

impl VersionToken {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Condition checked before a transaction applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    KeyExists(String),
    KeyAbsent(String),
    VersionMatches(String, VersionToken),
    HashFieldEquals {
        key: String,
        field: String,
        value: Vec<u8>,
    },
}

/// One mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Remove {
        key: String,
    },
    HashSet {
        key: String,
        field: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    HashRemove {
        key: String,
        field: String,
    },
    HashIncrement {
        key: String,
        field: String,
        delta: i64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Preconditions plus operations, applied atomically by
/// [`CacheTransport::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    preconditions: Vec<Precondition>,
    operations: Vec<TransactionOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        self.operations.push(TransactionOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.operations.push(TransactionOp::Remove { key: key.into() });
        self
    }

    pub fn hash_set(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Self {
        self.operations.push(TransactionOp::HashSet {
            key: key.into(),
            field: field.into(),
            value,
            ttl,
        });
        self
    }

    pub fn hash_remove(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.operations.push(TransactionOp::HashRemove {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn hash_increment(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> Self {
        self.operations.push(TransactionOp::HashIncrement {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.operations.push(TransactionOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn operations(&self) -> &[TransactionOp] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Access to the shared remote cache.
#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// Read a plain value with its current version.
    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError>;

    /// Store only if the key is absent. Returns whether the value was stored.
    async fn add_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, TransportError>;

    /// Store unconditionally.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, TransportError>;

    /// Store only if the entry still carries `token`.
    async fn replace_if_version_matches(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        token: VersionToken,
    ) -> Result<bool, TransportError>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, TransportError>;

    /// Remove several keys. Returns how many existed.
    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError>;

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError>;

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError>;

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError>;

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError>;

    /// Add `delta` to a decimal counter field, creating it at zero.
    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError>;

    fn begin_transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Apply a transaction. Returns `false` when a precondition failed, in
    /// which case nothing was applied.
    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError>;

    fn key_length_limit(&self) -> usize {
        DEFAULT_KEY_LENGTH_LIMIT
    }
}

#[async_trait]
impl<T: CacheTransport + ?Sized> CacheTransport for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).get(key).await
    }

    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError> {
        (**self).get_with_version(key).await
    }

    async fn add_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, TransportError> {
        (**self).add_if_absent(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, TransportError> {
        (**self).set(key, value, ttl).await
    }

    async fn replace_if_version_matches(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        token: VersionToken,
    ) -> Result<bool, TransportError> {
        (**self)
            .replace_if_version_matches(key, value, ttl, token)
            .await
    }

    async fn remove(&self, key: &str) -> Result<bool, TransportError> {
        (**self).remove(key).await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError> {
        (**self).remove_many(keys).await
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        (**self).hash_set(key, field, value, ttl).await
    }

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        (**self).hash_remove_field(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError> {
        (**self).hash_get_all(key).await
    }

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        (**self).hash_field_exists(key, field).await
    }

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError> {
        (**self).hash_length(key).await
    }

    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError> {
        (**self).hash_increment_field(key, field, delta).await
    }

    fn begin_transaction(&self) -> Transaction {
        (**self).begin_transaction()
    }

    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError> {
        (**self).execute(transaction).await
    }

    fn key_length_limit(&self) -> usize {
        (**self).key_length_limit()
    }
}

/// Parse a decimal counter stored in a hash field.
pub(crate) fn parse_counter(key: &str, field: &str, raw: &[u8]) -> Result<i64, TransportError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| TransportError::Backend {
            reason: format!("hash field {key}.{field} is not an integer"),
        })
}

/// Absolute expiry in unix milliseconds for a TTL; 0 means never.
pub(crate) fn expiry_millis(ttl: Duration) -> i64 {
    if ttl.is_zero() {
        0
    } else {
        chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64
    }
}

pub(crate) fn is_expired(expires_at_ms: i64) -> bool {
    expires_at_ms != 0 && expires_at_ms <= chrono::Utc::now().timestamp_millis()
}
