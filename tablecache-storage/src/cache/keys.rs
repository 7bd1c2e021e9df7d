//! Cache key derivation.
//!
//! Every key the engine writes is derived here from the bound table and
//! partition. Components are escaped so the mapping stays injective, and a
//! key longer than the effective limit comes back as `None`: that unit of
//! data is simply not cacheable.
//!
//! # Key Format
//!
//! ```text
//! {table}:e:{entity}                    entity entry (table-wide)
//! {scope}:i:{conditions}                full index
//! {scope}:p:{fields}:{conditions}       projection index
//! {scope}:indexes                       index list
//! {scope}:lock:{name}                   table lock
//! ```
//!
//! `{scope}` is `{table}` for the whole-table scope and
//! `{table}@{partition}` for a partition scope.

use tablecache_core::key::escape_component;
use tablecache_core::{EntityKey, KeyValue, SearchConditions};

/// Which set of indexes a key belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexScope {
    /// Indexes over the whole table.
    Table,
    /// Indexes restricted to one partition key value.
    Partition(KeyValue),
}

impl IndexScope {
    pub fn from_partition(partition: Option<&KeyValue>) -> Self {
        match partition {
            Some(value) => IndexScope::Partition(value.clone()),
            None => IndexScope::Table,
        }
    }

    /// Whether an entity with this key belongs to the scope.
    pub fn contains(&self, key: &EntityKey) -> bool {
        match self {
            IndexScope::Table => true,
            IndexScope::Partition(partition) => key.hash() == partition,
        }
    }
}

/// Key derivation for one bound table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    table: String,
    max_len: usize,
}

impl CacheKeys {
    pub fn new(table: &str, max_len: usize) -> Self {
        // '@' separates table and partition, so it must not appear raw
        Self {
            table: escape_component(table).replace('@', "%40"),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn entity(&self, key: &EntityKey) -> Option<String> {
        self.bounded(format!("{}:e:{}", self.table, key.cache_component()))
    }

    pub fn index(&self, scope: &IndexScope, conditions: &SearchConditions) -> Option<String> {
        self.bounded(format!(
            "{}:i:{}",
            self.scope_prefix(scope),
            escape_component(&conditions.key())
        ))
    }

    pub fn projection_index(
        &self,
        scope: &IndexScope,
        conditions: &SearchConditions,
        fields: &[String],
    ) -> Option<String> {
        let fields = serde_json::to_string(fields).ok()?;
        self.bounded(format!(
            "{}:p:{}:{}",
            self.scope_prefix(scope),
            escape_component(&fields),
            escape_component(&conditions.key())
        ))
    }

    pub fn index_list(&self, scope: &IndexScope) -> Option<String> {
        self.bounded(format!("{}:indexes", self.scope_prefix(scope)))
    }

    pub fn lock(&self, scope: &IndexScope, name: &str) -> Option<String> {
        self.bounded(format!(
            "{}:lock:{}",
            self.scope_prefix(scope),
            escape_component(name)
        ))
    }

    fn scope_prefix(&self, scope: &IndexScope) -> String {
        match scope {
            IndexScope::Table => self.table.clone(),
            IndexScope::Partition(value) => format!("{}@{}", self.table, value.cache_component()),
        }
    }

    fn bounded(&self, key: String) -> Option<String> {
        if key.len() <= self.max_len {
            Some(key)
        } else {
            None
        }
    }
}
