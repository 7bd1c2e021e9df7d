//! Client-side ordering of query results.
//!
//! Results served from an index come back in membership order, so any
//! requested ordering is applied here. Comparers are picked from the declared
//! [`FieldType`] and cached per (entity type, field).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Document, EntitySchema, FieldType};

/// Requested ordering of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Compares one field of two documents. Absent and null sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldComparer {
    field_type: FieldType,
}

impl FieldComparer {
    pub fn new(field_type: FieldType) -> Self {
        Self { field_type }
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Compare two field values (either may be absent).
    pub fn compare(&self, a: Option<&Value>, b: Option<&Value>) -> Ordering {
        let a = a.filter(|v| !v.is_null());
        let b = b.filter(|v| !v.is_null());
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => match self.field_type {
                FieldType::Number => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    _ => compare_any(a, b),
                },
                FieldType::String | FieldType::Binary => match (a.as_str(), b.as_str()) {
                    (Some(x), Some(y)) => x.cmp(y),
                    _ => compare_any(a, b),
                },
                FieldType::Bool => match (a.as_bool(), b.as_bool()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => compare_any(a, b),
                },
                FieldType::Any => compare_any(a, b),
            },
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type rank, then by value.
fn compare_any(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_any(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Per-instance cache of field comparers.
#[derive(Debug, Default)]
pub struct ComparerCache {
    comparers: RwLock<HashMap<(String, String), Arc<FieldComparer>>>,
}

impl ComparerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Comparer for a field of the schema's entity type.
    pub fn comparer_for(&self, schema: &EntitySchema, field: &str) -> Arc<FieldComparer> {
        let key = (schema.entity_type().to_string(), field.to_string());
        if let Some(found) = self
            .comparers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return found.clone();
        }
        let comparer = Arc::new(FieldComparer::new(schema.field_type(field)));
        self.comparers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(comparer)
            .clone()
    }

    /// Stable sort of documents by the requested order.
    pub fn sort(&self, schema: &EntitySchema, order: &OrderBy, documents: &mut [Document]) {
        let comparer = self.comparer_for(schema, &order.field);
        documents.sort_by(|a, b| {
            let ord = comparer.compare(a.get(&order.field), b.get(&order.field));
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    pub fn len(&self) -> usize {
        self.comparers.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn titles(docs: &[Document]) -> Vec<String> {
        docs.iter()
            .map(|d| d.get("title").and_then(|t| t.as_str()).unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn test_numeric_sort_with_nulls_first() {
        let schema = EntitySchema::new("Book", "id").with_field("pages", FieldType::Number);
        let cache = ComparerCache::new();
        let mut docs = vec![
            doc(json!({"title": "b", "pages": 300})),
            doc(json!({"title": "a", "pages": 20})),
            doc(json!({"title": "c"})),
            doc(json!({"title": "d", "pages": 100})),
        ];
        cache.sort(&schema, &OrderBy::ascending("pages"), &mut docs);
        assert_eq!(titles(&docs), vec!["c", "a", "d", "b"]);

        cache.sort(&schema, &OrderBy::descending("pages"), &mut docs);
        assert_eq!(titles(&docs), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_sort_is_stable() {
        let schema = EntitySchema::new("Book", "id").with_field("genre", FieldType::String);
        let cache = ComparerCache::new();
        let mut docs = vec![
            doc(json!({"title": "1", "genre": "sf"})),
            doc(json!({"title": "2", "genre": "crime"})),
            doc(json!({"title": "3", "genre": "sf"})),
            doc(json!({"title": "4", "genre": "crime"})),
        ];
        cache.sort(&schema, &OrderBy::ascending("genre"), &mut docs);
        assert_eq!(titles(&docs), vec!["2", "4", "1", "3"]);
    }

    #[test]
    fn test_any_falls_back_to_type_rank() {
        let comparer = FieldComparer::new(FieldType::Any);
        assert_eq!(
            comparer.compare(Some(&json!(true)), Some(&json!(1))),
            Ordering::Less
        );
        assert_eq!(
            comparer.compare(Some(&json!("a")), Some(&json!(99))),
            Ordering::Greater
        );
        assert_eq!(comparer.compare(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(comparer.compare(None, Some(&json!(null))), Ordering::Equal);
    }

    #[test]
    fn test_comparers_cached_per_entity_type() {
        let cache = ComparerCache::new();
        let book = EntitySchema::new("Book", "id").with_field("year", FieldType::Number);
        let film = EntitySchema::new("Film", "id").with_field("year", FieldType::String);
        assert_eq!(cache.comparer_for(&book, "year").field_type(), FieldType::Number);
        assert_eq!(cache.comparer_for(&film, "year").field_type(), FieldType::String);
        cache.comparer_for(&book, "year");
        assert_eq!(cache.len(), 2);
    }
}
