//! Backing document store contract and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tablecache_core::{
    Document, EntityKey, EntitySchema, KeyValue, SearchConditions, StoreError, TableCacheResult,
};

/// The authoritative store behind a table cache.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one item by key.
    async fn get_item(&self, table: &str, key: &EntityKey) -> TableCacheResult<Option<Document>>;

    /// Every item matching `conditions`, optionally restricted to one
    /// partition (hash key value).
    async fn query(
        &self,
        table: &str,
        partition: Option<&KeyValue>,
        conditions: &SearchConditions,
    ) -> TableCacheResult<Vec<Document>>;

    /// Fetch several items; missing keys are skipped.
    async fn batch_get(&self, table: &str, keys: &[EntityKey]) -> TableCacheResult<Vec<Document>>;

    /// Insert or replace an item.
    async fn put_item(&self, table: &str, document: &Document) -> TableCacheResult<()>;

    /// Delete an item. Returns whether it existed.
    async fn delete_item(&self, table: &str, key: &EntityKey) -> TableCacheResult<bool>;
}

struct StoredTable {
    schema: EntitySchema,
    items: BTreeMap<EntityKey, Document>,
}

/// In-memory store for tests and demos.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    tables: RwLock<HashMap<String, StoredTable>>,
    fail_writes: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a table.
    pub fn create_table(&self, table: &str, schema: EntitySchema) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.insert(
            table.to_string(),
            StoredTable {
                schema,
                items: BTreeMap::new(),
            },
        );
    }

    /// Make every subsequent write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of items in a table.
    pub fn item_count(&self, table: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(|t| t.items.len()).unwrap_or(0)
    }

    fn check_writable(&self, operation: &str) -> TableCacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(failed(operation, "writes disabled"));
        }
        Ok(())
    }
}

fn failed(operation: &str, reason: impl Into<String>) -> tablecache_core::TableCacheError {
    StoreError::OperationFailed {
        operation: operation.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn unknown_table(operation: &str, table: &str) -> tablecache_core::TableCacheError {
    failed(operation, format!("no such table {}", table))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_item(&self, table: &str, key: &EntityKey) -> TableCacheResult<Option<Document>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let stored = tables
            .get(table)
            .ok_or_else(|| unknown_table("get_item", table))?;
        Ok(stored.items.get(key).cloned())
    }

    async fn query(
        &self,
        table: &str,
        partition: Option<&KeyValue>,
        conditions: &SearchConditions,
    ) -> TableCacheResult<Vec<Document>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let stored = tables
            .get(table)
            .ok_or_else(|| unknown_table("query", table))?;
        let mut results = Vec::new();
        for (key, document) in &stored.items {
            if partition.is_some_and(|p| key.hash() != p) {
                continue;
            }
            if conditions.matches(document)? {
                results.push(document.clone());
            }
        }
        Ok(results)
    }

    async fn batch_get(&self, table: &str, keys: &[EntityKey]) -> TableCacheResult<Vec<Document>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let stored = tables
            .get(table)
            .ok_or_else(|| unknown_table("batch_get", table))?;
        Ok(keys
            .iter()
            .filter_map(|key| stored.items.get(key).cloned())
            .collect())
    }

    async fn put_item(&self, table: &str, document: &Document) -> TableCacheResult<()> {
        self.check_writable("put_item")?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| unknown_table("put_item", table))?;
        let key = stored.schema.key_of(document)?;
        stored.items.insert(key, document.clone());
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: &EntityKey) -> TableCacheResult<bool> {
        self.check_writable("delete_item")?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| unknown_table("delete_item", table))?;
        Ok(stored.items.remove(key).is_some())
    }
}
