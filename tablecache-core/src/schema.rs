//! Entity schema: how a document maps to its key and how fields order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Document, EntityKey, KeyError, KeyValue};

/// Declared type of an entity field.
///
/// Drives the comparer used for client-side ordering of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Binary,
    /// Undeclared; ordering falls back to JSON type rank.
    #[default]
    Any,
}

/// Shape of the single entity type a table cache is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    entity_type: String,
    hash_key: String,
    range_key: Option<String>,
    field_types: BTreeMap<String, FieldType>,
}

impl EntitySchema {
    /// Schema for a hash-keyed entity type.
    pub fn new(entity_type: impl Into<String>, hash_key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            hash_key: hash_key.into(),
            range_key: None,
            field_types: BTreeMap::new(),
        }
    }

    /// Add a range key field.
    pub fn with_range_key(mut self, range_key: impl Into<String>) -> Self {
        self.range_key = Some(range_key.into());
        self
    }

    /// Declare the type of a field.
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field_types.insert(name.into(), field_type);
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    pub fn range_key(&self) -> Option<&str> {
        self.range_key.as_deref()
    }

    /// Declared type of a field, `Any` when undeclared.
    pub fn field_type(&self, field: &str) -> FieldType {
        self.field_types.get(field).copied().unwrap_or_default()
    }

    /// Whether a field is part of the entity key.
    pub fn is_key_field(&self, field: &str) -> bool {
        field == self.hash_key || self.range_key.as_deref() == Some(field)
    }

    /// Extract the entity key from a document.
    pub fn key_of(&self, document: &Document) -> Result<EntityKey, KeyError> {
        let hash = Self::key_value(document, &self.hash_key)?;
        match &self.range_key {
            Some(range_field) => {
                let range = Self::key_value(document, range_field)?;
                Ok(EntityKey::with_range(hash, range))
            }
            None => Ok(EntityKey::new(hash)),
        }
    }

    /// Write a key back into a document's key fields.
    pub fn write_key(&self, key: &EntityKey, document: &mut Document) {
        document.insert(self.hash_key.clone(), key.hash().to_json());
        if let (Some(field), Some(range)) = (&self.range_key, key.range()) {
            document.insert(field.clone(), range.to_json());
        }
    }

    fn key_value(document: &Document, field: &str) -> Result<KeyValue, KeyError> {
        let value = document.get(field).ok_or_else(|| KeyError::MissingField {
            field: field.to_string(),
        })?;
        KeyValue::from_json(field, value)
    }
}
