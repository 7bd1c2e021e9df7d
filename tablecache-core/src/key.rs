//! Entity key primitives.
//!
//! An [`EntityKey`] is the identity of a cached entity: a partition (hash)
//! key primitive plus an optional sort (range) key primitive. Equality and
//! hashing are by value.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

use crate::KeyError;

/// A key primitive as understood by the backing document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    /// String key.
    S(String),
    /// Numeric key in canonical textual form.
    N(String),
    /// Binary key.
    B(Vec<u8>),
}

impl KeyValue {
    /// Create a string key.
    pub fn string(value: impl Into<String>) -> Self {
        KeyValue::S(value.into())
    }

    /// Create a numeric key from an integer.
    pub fn number(value: i64) -> Self {
        KeyValue::N(value.to_string())
    }

    /// Convert a JSON value taken from a document key field.
    ///
    /// Only strings and numbers can act as keys inside a JSON document.
    pub fn from_json(field: &str, value: &Value) -> Result<Self, KeyError> {
        match value {
            Value::String(s) => Ok(KeyValue::S(s.clone())),
            Value::Number(n) => Ok(KeyValue::N(canonical_number(n))),
            other => Err(KeyError::InvalidType {
                field: field.to_string(),
                found: json_type_name(other).to_string(),
            }),
        }
    }

    /// Convert back into the JSON value stored in a document.
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::S(s) => Value::String(s.clone()),
            KeyValue::N(n) => serde_json::from_str::<Number>(n)
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(n.clone())),
            KeyValue::B(b) => Value::String(hex::encode(b)),
        }
    }

    /// Type-prefixed, escaped form used inside cache keys.
    ///
    /// The prefix keeps `S("1")` and `N("1")` apart.
    pub fn cache_component(&self) -> String {
        match self {
            KeyValue::S(s) => format!("s{}", escape_component(s)),
            KeyValue::N(n) => format!("n{}", n),
            KeyValue::B(b) => format!("b{}", hex::encode(b)),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::S(s) => write!(f, "{}", s),
            KeyValue::N(n) => write!(f, "{}", n),
            KeyValue::B(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::S(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::S(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::number(value)
    }
}

/// Identity of a cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    hash: KeyValue,
    range: Option<KeyValue>,
}

impl EntityKey {
    /// Key for a hash-only table.
    pub fn new(hash: impl Into<KeyValue>) -> Self {
        Self {
            hash: hash.into(),
            range: None,
        }
    }

    /// Key for a hash + range table.
    pub fn with_range(hash: impl Into<KeyValue>, range: impl Into<KeyValue>) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }

    /// The partition (hash) key value.
    pub fn hash(&self) -> &KeyValue {
        &self.hash
    }

    /// The sort (range) key value, if the table has one.
    pub fn range(&self) -> Option<&KeyValue> {
        self.range.as_ref()
    }

    /// Whether this key carries a sort key.
    pub fn has_range(&self) -> bool {
        self.range.is_some()
    }

    /// Escaped form used inside cache keys.
    pub fn cache_component(&self) -> String {
        match &self.range {
            Some(range) => format!("{}/{}", self.hash.cache_component(), range.cache_component()),
            None => self.hash.cache_component(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "({}, {})", self.hash, range),
            None => write!(f, "({})", self.hash),
        }
    }
}

/// Percent-encode the characters a cache key component must not carry raw.
///
/// `%` itself is always encoded, which keeps the mapping injective.
pub fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '%' || ch == ':' || ch == '/' || ch.is_whitespace() || ch.is_control() {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Canonical text of a JSON number: integral floats collapse to integers.
pub fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Human-readable JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
