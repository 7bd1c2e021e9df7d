//! Cache events and statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Observer of cache decisions. Every method defaults to a no-op.
pub trait CacheEvents: Send + Sync {
    /// A query or point lookup was answered from the cache.
    fn on_hit(&self, _table: &str) {}

    /// A query or point lookup has to go to the backing store.
    fn on_miss(&self, _table: &str) {}

    /// A log-worthy engine decision (discarded build, forced lock takeover,
    /// dropped index, batch compensation).
    fn on_log(&self, _message: &str) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl CacheEvents for NoopEvents {}

/// Snapshot of a table cache's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entity_writes: u64,
    pub index_writes: u64,
    pub index_removals: u64,
}

impl CacheStats {
    /// Calculate the hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    entity_writes: AtomicU64,
    index_writes: AtomicU64,
    index_removals: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entity_writes(&self, count: u64) {
        self.entity_writes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn index_write(&self) {
        self.index_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn index_removals(&self, count: u64) {
        self.index_removals.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entity_writes: self.entity_writes.load(Ordering::Relaxed),
            index_writes: self.index_writes.load(Ordering::Relaxed),
            index_removals: self.index_removals.load(Ordering::Relaxed),
        }
    }
}
