//! Cached index values.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tablecache_core::{Document, EntityKey, SearchConditions, TableCacheResult};

/// Membership of one query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedIndex {
    pub being_rebuilt: bool,
    pub members: BTreeSet<EntityKey>,
    pub conditions: SearchConditions,
}

impl CachedIndex {
    /// An empty index under construction.
    pub fn rebuilding(conditions: SearchConditions) -> Self {
        Self {
            being_rebuilt: true,
            members: BTreeSet::new(),
            conditions,
        }
    }
}

/// Projected documents of one query shape. Never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedProjectionIndex {
    pub being_rebuilt: bool,
    pub documents: Vec<Document>,
    pub conditions: SearchConditions,
    pub fields: Vec<String>,
}

impl CachedProjectionIndex {
    pub fn rebuilding(conditions: SearchConditions, fields: Vec<String>) -> Self {
        Self {
            being_rebuilt: true,
            documents: Vec::new(),
            conditions,
            fields,
        }
    }
}

/// Stored form of either index kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexEntry {
    Full(CachedIndex),
    Projection(CachedProjectionIndex),
}

impl IndexEntry {
    pub fn being_rebuilt(&self) -> bool {
        match self {
            IndexEntry::Full(index) => index.being_rebuilt,
            IndexEntry::Projection(index) => index.being_rebuilt,
        }
    }

    /// Whether this still looks exactly like a freshly started build.
    pub fn is_fresh_build(&self) -> bool {
        match self {
            IndexEntry::Full(index) => index.being_rebuilt && index.members.is_empty(),
            IndexEntry::Projection(index) => index.being_rebuilt && index.documents.is_empty(),
        }
    }

    pub fn encode(&self) -> TableCacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> TableCacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
