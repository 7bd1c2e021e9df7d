//! Search conditions: the field-level predicate set a cached index answers.
//!
//! A [`SearchConditions`] value is produced by the query-translation layer
//! and is treated as immutable here. Conditions on different fields are
//! ANDed; a field may carry several conditions (e.g. a lower and an upper
//! bound). Fields are kept sorted so the canonical [`SearchConditions::key`]
//! does not depend on the order the translator emitted them in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::ConditionError;

/// Comparison operator applied to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOperator {
    /// Equal to
    Equal,
    /// Not equal to
    NotEqual,
    /// Less than
    LessThan,
    /// Less than or equal
    LessThanOrEqual,
    /// Greater than
    GreaterThan,
    /// Greater than or equal
    GreaterThanOrEqual,
    /// Inclusive range, two values
    Between,
    /// In list of values
    In,
    /// String prefix
    BeginsWith,
    /// Substring or array element
    Contains,
    /// Negated `Contains`
    NotContains,
    /// Field absent or null
    IsNull,
    /// Field present and not null
    IsNotNull,
}

impl ScanOperator {
    /// Short code used in canonical condition keys.
    pub fn code(&self) -> &'static str {
        match self {
            ScanOperator::Equal => "EQ",
            ScanOperator::NotEqual => "NE",
            ScanOperator::LessThan => "LT",
            ScanOperator::LessThanOrEqual => "LE",
            ScanOperator::GreaterThan => "GT",
            ScanOperator::GreaterThanOrEqual => "GE",
            ScanOperator::Between => "BETWEEN",
            ScanOperator::In => "IN",
            ScanOperator::BeginsWith => "BEGINS",
            ScanOperator::Contains => "CONTAINS",
            ScanOperator::NotContains => "NCONTAINS",
            ScanOperator::IsNull => "NULL",
            ScanOperator::IsNotNull => "NOTNULL",
        }
    }

    /// Validate the number of operand values.
    pub fn check_arity(&self, field: &str, got: usize) -> Result<(), ConditionError> {
        let (ok, expected) = match self {
            ScanOperator::Between => (got == 2, "2"),
            ScanOperator::In => (got >= 1, "at least 1"),
            ScanOperator::IsNull | ScanOperator::IsNotNull => (got == 0, "0"),
            _ => (got == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(ConditionError::InvalidArity {
                field: field.to_string(),
                operator: format!("{:?}", self),
                expected: expected.to_string(),
                got,
            })
        }
    }
}

impl fmt::Display for ScanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One operator applied to a field, with its operand values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCondition {
    pub operator: ScanOperator,
    pub values: Vec<Value>,
}

impl SearchCondition {
    pub fn new(operator: ScanOperator, values: Vec<Value>) -> Self {
        Self { operator, values }
    }

    fn key_fragment(&self) -> String {
        let values = serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string());
        format!("{}{}", self.operator.code(), values)
    }
}

/// The full predicate set for one query shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchConditions {
    fields: BTreeMap<String, Vec<SearchCondition>>,
}

impl SearchConditions {
    /// An empty condition set (matches every entity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition to a field.
    pub fn with(mut self, field: impl Into<String>, operator: ScanOperator, values: Vec<Value>) -> Self {
        self.fields
            .entry(field.into())
            .or_default()
            .push(SearchCondition::new(operator, values));
        self
    }

    /// Create an equality condition set.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new().with(field, ScanOperator::Equal, vec![value])
    }

    /// Whether there are no conditions at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of constrained fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Iterate fields with their conditions, in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[SearchCondition])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Conditions on one field.
    pub fn conditions_for(&self, field: &str) -> &[SearchCondition] {
        self.fields.get(field).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Canonical, deterministic key for this condition set.
    ///
    /// Field names are JSON-quoted and operand lists JSON-encoded so the
    /// mapping stays injective whatever characters they contain.
    pub fn key(&self) -> String {
        let mut parts = Vec::with_capacity(self.fields.len());
        for (field, conditions) in &self.fields {
            let quoted = serde_json::to_string(field).unwrap_or_else(|_| field.clone());
            let body: Vec<String> = conditions.iter().map(|c| c.key_fragment()).collect();
            parts.push(format!("{}:{}", quoted, body.join(",")));
        }
        parts.join("&")
    }
}

impl fmt::Display for SearchConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
