//! TABLECACHE Test Utilities
//!
//! Shared test infrastructure for the tablecache workspace:
//! - Fixture entities and documents
//! - Transports over both cache backends
//! - A fault-injecting transport
//! - Proptest generators

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

// Re-export core types for convenience
pub use tablecache_core::{
    CacheableEntity, ChangeSet, Document, EntityKey, EntitySchema, FieldType, KeyValue, OrderBy,
    ScanOperator, SearchConditions, TableCacheConfig, TableCacheError, TableCacheResult,
    TransportError,
};
pub use tablecache_storage::{
    CacheTransport, HashMapTransport, InMemoryDocumentStore, LmdbTransport, TableCache,
    Transaction, TransactionOp, VersionToken,
};

/// Install a `tracing` subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Hash-keyed fixture entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub author: String,
    pub title: String,
    pub pages: i64,
    pub genre: String,
}

impl CacheableEntity for Book {
    fn schema() -> EntitySchema {
        EntitySchema::new("Book", "id")
            .with_field("author", FieldType::String)
            .with_field("title", FieldType::String)
            .with_field("pages", FieldType::Number)
            .with_field("genre", FieldType::String)
    }
}

impl Book {
    pub fn new(id: &str, author: &str, pages: i64, genre: &str) -> Self {
        Self {
            id: id.to_string(),
            author: author.to_string(),
            title: format!("Title of {}", id),
            pages,
            genre: genre.to_string(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.id.as_str())
    }

    pub fn document(&self) -> Document {
        tablecache_core::to_document(self).unwrap_or_default()
    }
}

/// Range-keyed fixture entity, partitioned by book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub book_id: String,
    pub seq: i64,
    pub stars: i64,
}

impl CacheableEntity for Review {
    fn schema() -> EntitySchema {
        EntitySchema::new("Review", "book_id")
            .with_range_key("seq")
            .with_field("stars", FieldType::Number)
    }
}

impl Review {
    pub fn new(book_id: &str, seq: i64, stars: i64) -> Self {
        Self {
            book_id: book_id.to_string(),
            seq,
            stars,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::with_range(self.book_id.as_str(), self.seq)
    }

    pub fn document(&self) -> Document {
        tablecache_core::to_document(self).unwrap_or_default()
    }
}

/// Conditions selecting books of one genre.
pub fn genre_is(genre: &str) -> SearchConditions {
    SearchConditions::eq("genre", serde_json::json!(genre))
}

/// Conditions selecting books longer than `pages`.
pub fn longer_than(pages: i64) -> SearchConditions {
    SearchConditions::new().with("pages", ScanOperator::GreaterThan, vec![serde_json::json!(pages)])
}

// ============================================================================
// TRANSPORTS
// ============================================================================

/// A transport under test plus whatever keeps it alive.
pub struct TestTransport {
    pub name: &'static str,
    pub transport: Arc<dyn CacheTransport>,
    _dir: Option<TempDir>,
}

pub fn memory_transport() -> TestTransport {
    TestTransport {
        name: "memory",
        transport: Arc::new(HashMapTransport::new()),
        _dir: None,
    }
}

pub fn lmdb_transport() -> TestTransport {
    let dir = TempDir::new().expect("temp dir");
    let transport = LmdbTransport::new(dir.path(), 16).expect("lmdb transport");
    TestTransport {
        name: "lmdb",
        transport: Arc::new(transport),
        _dir: Some(dir),
    }
}

/// One transport per backend.
pub fn all_transports() -> Vec<TestTransport> {
    vec![memory_transport(), lmdb_transport()]
}

/// A bound table cache with fast lock polling.
pub fn bound_cache(
    transport: Arc<dyn CacheTransport>,
    table: &str,
    schema: EntitySchema,
    partition: Option<KeyValue>,
) -> TableCache {
    let config = TableCacheConfig::default().with_lock_poll_interval(Duration::from_millis(2));
    let cache = TableCache::new(transport, config).expect("valid config");
    cache
        .initialize(table, schema, partition)
        .expect("fresh cache binds");
    cache
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Transport wrapper that injects failures.
///
/// - writes to keys containing a registered pattern fail permanently;
/// - the next `n` calls of any kind fail with a transient timeout;
/// - version-guarded replaces can be made to always lose.
pub struct FaultyTransport {
    inner: Arc<dyn CacheTransport>,
    failing_patterns: Mutex<Vec<String>>,
    transient_budget: AtomicUsize,
    lose_replaces: AtomicBool,
    calls: AtomicUsize,
}

impl FaultyTransport {
    pub fn new(inner: Arc<dyn CacheTransport>) -> Self {
        Self {
            inner,
            failing_patterns: Mutex::new(Vec::new()),
            transient_budget: AtomicUsize::new(0),
            lose_replaces: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every write to a key containing `pattern`.
    pub fn fail_writes_matching(&self, pattern: &str) {
        self.failing_patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pattern.to_string());
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next_transient(&self, count: usize) {
        self.transient_budget.store(count, Ordering::SeqCst);
    }

    /// Make every `replace_if_version_matches` report a lost race.
    pub fn lose_every_replace(&self, lose: bool) {
        self.lose_replaces.store(lose, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.failing_patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.transient_budget.store(0, Ordering::SeqCst);
        self.lose_replaces.store(false, Ordering::SeqCst);
    }

    /// Calls seen so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self, operation: &str, written: &[&str]) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let transient = self
            .transient_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(TransportError::Timeout {
                operation: operation.to_string(),
                elapsed: Duration::from_millis(1),
            });
        }
        let patterns = self
            .failing_patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(key) = written
            .iter()
            .find(|key| patterns.iter().any(|p| key.contains(p.as_str())))
        {
            return Err(TransportError::Backend {
                reason: format!("injected failure writing {}", key),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheTransport for FaultyTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.gate("get", &[])?;
        self.inner.get(key).await
    }

    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError> {
        self.gate("get_with_version", &[])?;
        self.inner.get_with_version(key).await
    }

    async fn add_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, TransportError> {
        self.gate("add_if_absent", &[key])?;
        self.inner.add_if_absent(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, TransportError> {
        self.gate("set", &[key])?;
        self.inner.set(key, value, ttl).await
    }

    async fn replace_if_version_matches(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        token: VersionToken,
    ) -> Result<bool, TransportError> {
        self.gate("replace_if_version_matches", &[key])?;
        if self.lose_replaces.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner
            .replace_if_version_matches(key, value, ttl, token)
            .await
    }

    async fn remove(&self, key: &str) -> Result<bool, TransportError> {
        self.gate("remove", &[key])?;
        self.inner.remove(key).await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError> {
        // Cleanup path; never faulted
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_many(keys).await
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        self.gate("hash_set", &[key])?;
        self.inner.hash_set(key, field, value, ttl).await
    }

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        self.gate("hash_remove_field", &[key])?;
        self.inner.hash_remove_field(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError> {
        self.gate("hash_get_all", &[])?;
        self.inner.hash_get_all(key).await
    }

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        self.gate("hash_field_exists", &[])?;
        self.inner.hash_field_exists(key, field).await
    }

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError> {
        self.gate("hash_length", &[])?;
        self.inner.hash_length(key).await
    }

    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError> {
        self.gate("hash_increment_field", &[key])?;
        self.inner.hash_increment_field(key, field, delta).await
    }

    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError> {
        let written: Vec<&str> = transaction
            .operations()
            .iter()
            .map(|op| match op {
                TransactionOp::Set { key, .. }
                | TransactionOp::Remove { key }
                | TransactionOp::HashSet { key, .. }
                | TransactionOp::HashRemove { key, .. }
                | TransactionOp::HashIncrement { key, .. }
                | TransactionOp::Expire { key, .. } => key.as_str(),
            })
            .collect();
        self.gate("execute", &written)?;
        self.inner.execute(transaction).await
    }

    fn key_length_limit(&self) -> usize {
        self.inner.key_length_limit()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Generate a key value of any kind.
    pub fn arb_key_value() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            "[a-zA-Z0-9 :/@%]{1,12}".prop_map(KeyValue::string),
            any::<i64>().prop_map(KeyValue::number),
            proptest::collection::vec(any::<u8>(), 1..8).prop_map(KeyValue::B),
        ]
    }

    /// Generate an entity key, with or without a range part.
    pub fn arb_entity_key() -> impl Strategy<Value = EntityKey> {
        (arb_key_value(), proptest::option::of(arb_key_value())).prop_map(|(hash, range)| {
            match range {
                Some(range) => EntityKey::with_range(hash, range),
                None => EntityKey::new(hash),
            }
        })
    }

    /// Generate a small book from a fixed id space, so batches collide.
    pub fn arb_book() -> impl Strategy<Value = Book> {
        (
            0u8..16,
            prop_oneof![Just("ann"), Just("bob"), Just("cy")],
            1i64..500,
            prop_oneof![Just("sf"), Just("crime"), Just("poetry")],
        )
            .prop_map(|(id, author, pages, genre)| {
                Book::new(&format!("b{}", id), author, pages, genre)
            })
    }

    /// Generate one of a few condition shapes over books.
    pub fn arb_book_conditions() -> impl Strategy<Value = SearchConditions> {
        prop_oneof![
            prop_oneof![Just("sf"), Just("crime"), Just("poetry")].prop_map(genre_is),
            (1i64..500).prop_map(longer_than),
            (1i64..250, 250i64..500).prop_map(|(lo, hi)| SearchConditions::new().with(
                "pages",
                ScanOperator::Between,
                vec![serde_json::json!(lo), serde_json::json!(hi)]
            )),
        ]
    }
}
