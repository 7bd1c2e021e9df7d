//! Predicate compilation for search conditions.
//!
//! Each condition is turned into a small closure once; the closures for a
//! condition set are ANDed into a [`CompiledPredicate`]. Compiled predicates
//! are cached per (entity type, condition key) in a [`PredicateCache`] owned
//! by the table cache that uses them. Once the cache exceeds its capacity a
//! random entry is evicted.

use rand::Rng;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::key::json_type_name;
use crate::{ConditionError, Document, ScanOperator, SearchCondition, SearchConditions};

type FieldTest = Box<dyn Fn(Option<&Value>) -> Result<bool, ConditionError> + Send + Sync>;

/// A compiled, shareable boolean predicate over documents.
#[derive(Clone)]
pub struct CompiledPredicate {
    tests: Arc<Vec<(String, FieldTest)>>,
}

impl CompiledPredicate {
    /// Compile a condition set. Fails on operand arity errors.
    pub fn compile(conditions: &SearchConditions) -> Result<Self, ConditionError> {
        let mut tests = Vec::new();
        for (field, field_conditions) in conditions.iter() {
            for condition in field_conditions {
                tests.push((field.to_string(), compile_condition(field, condition)?));
            }
        }
        Ok(Self {
            tests: Arc::new(tests),
        })
    }

    /// Evaluate against a document. A null field counts as absent.
    pub fn matches(&self, document: &Document) -> Result<bool, ConditionError> {
        for (field, test) in self.tests.iter() {
            let value = document.get(field).filter(|v| !v.is_null());
            if !test(value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for CompiledPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPredicate")
            .field("conditions", &self.tests.len())
            .finish()
    }
}

impl SearchConditions {
    /// One-off evaluation without caching.
    pub fn matches(&self, document: &Document) -> Result<bool, ConditionError> {
        CompiledPredicate::compile(self)?.matches(document)
    }
}

fn compile_condition(field: &str, condition: &SearchCondition) -> Result<FieldTest, ConditionError> {
    let operator = condition.operator;
    operator.check_arity(field, condition.values.len())?;
    let field = field.to_string();
    let values = condition.values.clone();

    let test: FieldTest = match operator {
        ScanOperator::Equal => {
            Box::new(move |v: Option<&Value>| Ok(v.map(|v| values_equal(v, &values[0])).unwrap_or(false)))
        }
        ScanOperator::NotEqual => {
            Box::new(move |v: Option<&Value>| Ok(v.map(|v| !values_equal(v, &values[0])).unwrap_or(true)))
        }
        ScanOperator::LessThan
        | ScanOperator::LessThanOrEqual
        | ScanOperator::GreaterThan
        | ScanOperator::GreaterThanOrEqual => Box::new(move |v: Option<&Value>| {
            let Some(v) = v else { return Ok(false) };
            let ord = compare_values(&field, v, &values[0])?;
            Ok(match operator {
                ScanOperator::LessThan => ord == Ordering::Less,
                ScanOperator::LessThanOrEqual => ord != Ordering::Greater,
                ScanOperator::GreaterThan => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }),
        ScanOperator::Between => Box::new(move |v: Option<&Value>| {
            let Some(v) = v else { return Ok(false) };
            Ok(compare_values(&field, v, &values[0])? != Ordering::Less
                && compare_values(&field, v, &values[1])? != Ordering::Greater)
        }),
        ScanOperator::In => Box::new(move |v: Option<&Value>| {
            Ok(v.map(|v| values.iter().any(|candidate| values_equal(v, candidate)))
                .unwrap_or(false))
        }),
        ScanOperator::BeginsWith => Box::new(move |v: Option<&Value>| {
            let Some(v) = v else { return Ok(false) };
            match (v, &values[0]) {
                (Value::String(s), Value::String(prefix)) => Ok(s.starts_with(prefix.as_str())),
                (other, expected) => Err(mismatch(&field, expected, other)),
            }
        }),
        ScanOperator::Contains => Box::new(move |v: Option<&Value>| match v {
            Some(v) => contains(&field, v, &values[0]),
            None => Ok(false),
        }),
        ScanOperator::NotContains => Box::new(move |v: Option<&Value>| match v {
            Some(v) => contains(&field, v, &values[0]).map(|found| !found),
            None => Ok(true),
        }),
        ScanOperator::IsNull => Box::new(|v: Option<&Value>| Ok(v.is_none())),
        ScanOperator::IsNotNull => Box::new(|v: Option<&Value>| Ok(v.is_some())),
    };
    Ok(test)
}

/// Equality with numeric tolerance (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order two scalar values of the same JSON type.
pub fn compare_values(field: &str, a: &Value, b: &Value) -> Result<Ordering, ConditionError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).ok_or_else(|| ConditionError::UnsupportedValue {
                field: field.to_string(),
                reason: "number is not comparable".to_string(),
            })
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (found, expected) => Err(mismatch(field, expected, found)),
    }
}

fn contains(field: &str, haystack: &Value, needle: &Value) -> Result<bool, ConditionError> {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Array(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (other, expected) => Err(mismatch(field, expected, other)),
    }
}

fn mismatch(field: &str, expected: &Value, found: &Value) -> ConditionError {
    ConditionError::TypeMismatch {
        field: field.to_string(),
        expected: json_type_name(expected).to_string(),
        found: json_type_name(found).to_string(),
    }
}

/// Bounded cache of compiled predicates keyed by (entity type, condition key).
#[derive(Debug)]
pub struct PredicateCache {
    capacity: usize,
    entries: RwLock<HashMap<(String, String), CompiledPredicate>>,
}

impl PredicateCache {
    /// Create a cache holding at most `capacity` predicates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a compiled predicate, compiling and caching it on first use.
    pub fn get_or_compile(
        &self,
        entity_type: &str,
        conditions: &SearchConditions,
    ) -> Result<CompiledPredicate, ConditionError> {
        let cache_key = (entity_type.to_string(), conditions.key());
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(predicate) = entries.get(&cache_key) {
                return Ok(predicate.clone());
            }
        }

        let predicate = CompiledPredicate::compile(conditions)?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(cache_key, predicate.clone());
        while entries.len() > self.capacity {
            let victim_index = rand::rng().random_range(0..entries.len());
            let victim = entries.keys().nth(victim_index).cloned();
            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                }
                None => break,
            }
        }
        Ok(predicate)
    }

    /// Number of cached predicates.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
