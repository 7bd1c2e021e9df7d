//! TABLECACHE Core - Data Types
//!
//! Keys, documents, search conditions and their compiled predicates, result
//! ordering, change tracking, lock records, configuration and the error
//! taxonomy. No I/O lives here; the cache engine and its transports are in
//! `tablecache-storage`.

pub mod conditions;
pub mod config;
pub mod entity;
pub mod error;
pub mod key;
pub mod lock;
pub mod ordering;
pub mod predicate;
pub mod schema;
pub mod tracking;

pub use conditions::{ScanOperator, SearchCondition, SearchConditions};
pub use config::TableCacheConfig;
pub use entity::{from_document, project_document, to_document, CacheableEntity};
pub use error::{
    ConditionError, ConfigError, KeyError, StoreError, TableCacheError, TableCacheResult,
    TransportError, UsageError,
};
pub use key::{EntityKey, KeyValue};
pub use lock::LockRecord;
pub use ordering::{ComparerCache, FieldComparer, OrderBy};
pub use predicate::{CompiledPredicate, PredicateCache};
pub use schema::{EntitySchema, FieldType};
pub use tracking::{ChangeSet, EntityState, TrackedEntity};

/// Untyped form of an entity: a JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;
