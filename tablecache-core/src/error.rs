//! Error types for tablecache operations

use std::time::Duration;
use thiserror::Error;

/// Cache transport errors.
///
/// Only [`TransportError::Timeout`] and [`TransportError::Communication`] are
/// transient; everything else is surfaced without retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport timed out during {operation} after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Transport communication failure: {reason}")]
    Communication { reason: String },

    #[error("Transport backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Transport lock poisoned")]
    LockPoisoned,
}

impl TransportError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Communication { .. }
        )
    }
}

/// Errors raised while compiling or evaluating search conditions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("Type mismatch on {field}: cannot compare {found} with {expected}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Operator {operator} on {field} expects {expected} value(s), got {got}")]
    InvalidArity {
        field: String,
        operator: String,
        expected: String,
        got: usize,
    },

    #[error("Unsupported value for {field}: {reason}")]
    UnsupportedValue { field: String, reason: String },
}

/// Errors extracting entity keys from documents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key field missing from document: {field}")]
    MissingField { field: String },

    #[error("Key field {field} has unsupported type {found}")]
    InvalidType { field: String, found: String },
}

/// Programmer or deployment errors. Never recovered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("Table cache already bound to {bound}, cannot rebind to {requested}")]
    AlreadyInitialized { bound: String, requested: String },

    #[error("Table cache used before initialize()")]
    NotInitialized,

    #[error("Recursive acquisition of table lock {name}")]
    RecursiveLock { name: String },

    #[error("Table lock {name} is not held by this cache")]
    LockNotHeld { name: String },

    #[error("Table lock {name} was taken over by another holder")]
    LockStolen { name: String },

    #[error("Table lock name {name} does not fit in a cache key of {limit} bytes")]
    LockNameTooLong { name: String, limit: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Backing document store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },
}

/// Master error type for all tablecache errors.
#[derive(Debug, Clone, Error)]
pub enum TableCacheError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl TableCacheError {
    /// Whether this error is a transient transport failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, TableCacheError::Transport(e) if e.is_transient())
    }
}

impl From<serde_json::Error> for TableCacheError {
    fn from(e: serde_json::Error) -> Self {
        TableCacheError::Transport(TransportError::Serialization {
            reason: e.to_string(),
        })
    }
}

/// Result type alias for tablecache operations.
pub type TableCacheResult<T> = Result<T, TableCacheError>;

// =============================================================================
// TESTS
// =============================================================================
