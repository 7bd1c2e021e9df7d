//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConfigError, TableCacheError, TableCacheResult};

/// Tuning knobs for a table cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCacheConfig {
    /// TTL applied to every entry written to the cache.
    pub entry_ttl: Duration,
    /// Upper bound on derived cache key length.
    pub max_key_length: usize,
    /// Capacity of each index list.
    pub max_indexes_per_table: usize,
    /// Fresh read + CAS attempts when patching one index.
    pub max_update_attempts: usize,
    /// Attempts per transport operation on transient errors.
    pub transport_retry_attempts: usize,
    pub lock_poll_interval: Duration,
    pub predicate_cache_capacity: usize,
    /// Concurrent cache writes per call.
    pub write_parallelism: usize,
}

impl Default for TableCacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(3600),
            max_key_length: 250,
            max_indexes_per_table: 100,
            max_update_attempts: 10,
            transport_retry_attempts: 3,
            lock_poll_interval: Duration::from_millis(10),
            predicate_cache_capacity: 300,
            write_parallelism: 16,
        }
    }
}

impl TableCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn with_max_key_length(mut self, length: usize) -> Self {
        self.max_key_length = length;
        self
    }

    pub fn with_max_indexes_per_table(mut self, count: usize) -> Self {
        self.max_indexes_per_table = count;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: usize) -> Self {
        self.max_update_attempts = attempts;
        self
    }

    pub fn with_transport_retry_attempts(mut self, attempts: usize) -> Self {
        self.transport_retry_attempts = attempts;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_predicate_cache_capacity(mut self, capacity: usize) -> Self {
        self.predicate_cache_capacity = capacity;
        self
    }

    pub fn with_write_parallelism(mut self, parallelism: usize) -> Self {
        self.write_parallelism = parallelism;
        self
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(TableCacheError::Config) if invalid.
    pub fn validate(&self) -> TableCacheResult<()> {
        if self.entry_ttl.is_zero() {
            return Err(invalid(
                "entry_ttl",
                format!("{:?}", self.entry_ttl),
                "entry_ttl must be positive",
            ));
        }

        // Room for the table prefix and a short suffix
        if self.max_key_length < 16 {
            return Err(invalid(
                "max_key_length",
                self.max_key_length.to_string(),
                "max_key_length must be at least 16",
            ));
        }

        let counts = [
            ("max_indexes_per_table", self.max_indexes_per_table),
            ("max_update_attempts", self.max_update_attempts),
            ("transport_retry_attempts", self.transport_retry_attempts),
            ("predicate_cache_capacity", self.predicate_cache_capacity),
            ("write_parallelism", self.write_parallelism),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(invalid(
                    field,
                    value.to_string(),
                    &format!("{} must be greater than 0", field),
                ));
            }
        }

        if self.lock_poll_interval.is_zero() {
            return Err(invalid(
                "lock_poll_interval",
                format!("{:?}", self.lock_poll_interval),
                "lock_poll_interval must be positive",
            ));
        }

        Ok(())
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TABLECACHE_ENTRY_TTL_SECS` (default: 3600)
    /// - `TABLECACHE_MAX_KEY_LENGTH` (default: 250)
    /// - `TABLECACHE_MAX_INDEXES_PER_TABLE` (default: 100)
    /// - `TABLECACHE_MAX_UPDATE_ATTEMPTS` (default: 10)
    /// - `TABLECACHE_TRANSPORT_RETRY_ATTEMPTS` (default: 3)
    /// - `TABLECACHE_LOCK_POLL_INTERVAL_MS` (default: 10)
    /// - `TABLECACHE_PREDICATE_CACHE_CAPACITY` (default: 300)
    /// - `TABLECACHE_WRITE_PARALLELISM` (default: 16)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            entry_ttl: env_parse::<u64>("TABLECACHE_ENTRY_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.entry_ttl),
            max_key_length: env_parse("TABLECACHE_MAX_KEY_LENGTH")
                .unwrap_or(defaults.max_key_length),
            max_indexes_per_table: env_parse("TABLECACHE_MAX_INDEXES_PER_TABLE")
                .unwrap_or(defaults.max_indexes_per_table),
            max_update_attempts: env_parse("TABLECACHE_MAX_UPDATE_ATTEMPTS")
                .unwrap_or(defaults.max_update_attempts),
            transport_retry_attempts: env_parse("TABLECACHE_TRANSPORT_RETRY_ATTEMPTS")
                .unwrap_or(defaults.transport_retry_attempts),
            lock_poll_interval: env_parse::<u64>("TABLECACHE_LOCK_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_poll_interval),
            predicate_cache_capacity: env_parse("TABLECACHE_PREDICATE_CACHE_CAPACITY")
                .unwrap_or(defaults.predicate_cache_capacity),
            write_parallelism: env_parse("TABLECACHE_WRITE_PARALLELISM")
                .unwrap_or(defaults.write_parallelism),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: String, reason: &str) -> TableCacheError {
    TableCacheError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

// =============================================================================
// TESTS
// =============================================================================
