//! Named table locks.
//!
//! A lock is a [`LockRecord`] stored under a key scoped to the bound table
//! and partition. Acquisition polls add-if-absent; after the timeout the
//! previous holder is presumed dead and the record is overwritten. Release
//! only removes the record while it still carries the holder's token.
//!
//! The engine never takes these locks itself; they guard caller-defined
//! critical sections.

use std::time::Duration;

use tablecache_core::{LockRecord, TableCacheResult, UsageError};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::TableCache;
use super::transport::{CacheTransport, Precondition};

/// A held table lock. Release it with [`TableLockGuard::release`].
#[must_use = "a table lock is held until released"]
pub struct TableLockGuard<'a> {
    cache: &'a TableCache,
    name: String,
    token: Uuid,
    forced: bool,
    released: bool,
}

impl TableLockGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Whether the lock was taken over from an unresponsive holder.
    pub fn was_forced(&self) -> bool {
        self.forced
    }

    /// Release the lock. Fails if another holder forcibly took it.
    pub async fn release(mut self) -> TableCacheResult<()> {
        self.released = true;
        self.cache.release_table_lock(&self.name).await
    }
}

impl Drop for TableLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!(lock = %self.name, "Table lock guard dropped without release; entry stays until it expires");
            self.cache.forget_lock(&self.name);
        }
    }
}

impl TableCache {
    /// Acquire a named lock, forcing it after `timeout`.
    pub async fn acquire_table_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> TableCacheResult<TableLockGuard<'_>> {
        let binding = self.binding()?;
        let lock_key = binding.keys.lock(&binding.own_scope(), name).ok_or_else(|| {
            UsageError::LockNameTooLong {
                name: name.to_string(),
                limit: binding.keys.max_len(),
            }
        })?;

        {
            // Reserved before polling; a second local caller fails at once
            let mut held = self.held_locks.lock().unwrap_or_else(|e| e.into_inner());
            if held.contains_key(name) {
                return Err(UsageError::RecursiveLock {
                    name: name.to_string(),
                }
                .into());
            }
            held.insert(name.to_string(), Uuid::nil());
        }

        let record = match self.poll_lock(&lock_key, name, timeout).await {
            Ok(record) => record,
            Err(e) => {
                self.forget_lock(name);
                return Err(e);
            }
        };
        self.held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), record.token);
        debug!(table = %binding.table, lock = %name, forced = record.forced, "Table lock acquired");
        Ok(TableLockGuard {
            cache: self,
            name: name.to_string(),
            token: record.token,
            forced: record.forced,
            released: false,
        })
    }

    /// Poll add-if-absent until the record is ours, forcing it at the
    /// deadline.
    async fn poll_lock(
        &self,
        lock_key: &str,
        name: &str,
        timeout: Duration,
    ) -> TableCacheResult<LockRecord> {
        let binding = self.binding()?;
        let ttl = self.config.entry_ttl;
        let deadline = Instant::now() + timeout;
        let mut record = LockRecord::new(name);
        loop {
            let bytes = serde_json::to_vec(&record)?;
            if self.transport.add_if_absent(lock_key, &bytes, ttl).await? {
                return Ok(record);
            }
            if Instant::now() >= deadline {
                record = LockRecord::new(name).forced();
                self.transport
                    .set(lock_key, &serde_json::to_vec(&record)?, ttl)
                    .await?;
                warn!(table = %binding.table, lock = %name, "Table lock not released in time, taken by force");
                self.report(&format!(
                    "Lock {} on {} was forcibly taken after {:?}",
                    name, binding.table, timeout
                ));
                return Ok(record);
            }
            tokio::time::sleep(self.config.lock_poll_interval).await;
            // Fresh token per attempt so a retried add never matches a stale one
            record = LockRecord::new(name);
        }
    }

    /// Release a lock held by this engine.
    pub async fn release_table_lock(&self, name: &str) -> TableCacheResult<()> {
        let binding = self.binding()?;
        let token = {
            let mut held = self.held_locks.lock().unwrap_or_else(|e| e.into_inner());
            held.remove(name).ok_or_else(|| UsageError::LockNotHeld {
                name: name.to_string(),
            })?
        };
        let stolen = || {
            warn!(table = %binding.table, lock = %name, "Table lock was taken by another holder");
            UsageError::LockStolen {
                name: name.to_string(),
            }
        };

        let Some(lock_key) = binding.keys.lock(&binding.own_scope(), name) else {
            return Err(stolen().into());
        };
        let Some((bytes, version)) = self.transport.get_with_version(&lock_key).await? else {
            return Err(stolen().into());
        };
        let record: LockRecord = serde_json::from_slice(&bytes)?;
        if !record.is_held_by(token) {
            return Err(stolen().into());
        }

        let txn = self
            .transport
            .begin_transaction()
            .add_precondition(Precondition::VersionMatches(lock_key.clone(), version))
            .remove(lock_key);
        if !self.transport.execute(txn).await? {
            return Err(stolen().into());
        }
        debug!(table = %binding.table, lock = %name, "Table lock released");
        Ok(())
    }

    pub(crate) fn forget_lock(&self, name: &str) {
        let mut held = self.held_locks.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::transport::HashMapTransport;
    use tablecache_core::{EntitySchema, TableCacheConfig, TableCacheError};

    fn engine(transport: Arc<HashMapTransport>) -> TableCache {
        let config = TableCacheConfig::default().with_lock_poll_interval(Duration::from_millis(2));
        let cache = TableCache::new(transport, config).unwrap();
        cache
            .initialize("Books", EntitySchema::new("Book", "id"), None)
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let cache = engine(Arc::new(HashMapTransport::new()));
        let guard = cache
            .acquire_table_lock("nightly", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!guard.was_forced());
        guard.release().await.unwrap();
        // Free again
        let again = cache
            .acquire_table_lock("nightly", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!again.was_forced());
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_recursive_acquire_rejected() {
        let cache = engine(Arc::new(HashMapTransport::new()));
        let guard = cache
            .acquire_table_lock("nightly", Duration::from_millis(50))
            .await
            .unwrap();
        let err = cache
            .acquire_table_lock("nightly", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TableCacheError::Usage(UsageError::RecursiveLock { .. })
        ));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unknown_lock() {
        let cache = engine(Arc::new(HashMapTransport::new()));
        let err = cache.release_table_lock("never").await.unwrap_err();
        assert!(matches!(
            err,
            TableCacheError::Usage(UsageError::LockNotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_forced_takeover_then_stolen_release() {
        let transport = Arc::new(HashMapTransport::new());
        let first = engine(transport.clone());
        let second = engine(transport);

        let original = first
            .acquire_table_lock("nightly", Duration::from_millis(20))
            .await
            .unwrap();
        let forced = second
            .acquire_table_lock("nightly", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(forced.was_forced());
        assert_ne!(original.token(), forced.token());

        let err = original.release().await.unwrap_err();
        assert!(matches!(
            err,
            TableCacheError::Usage(UsageError::LockStolen { .. })
        ));
        forced.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_contender_leaves_winner_intact() {
        let cache = engine(Arc::new(HashMapTransport::new()));
        let (a, b) = tokio::join!(
            cache.acquire_table_lock("nightly", Duration::from_millis(20)),
            cache.acquire_table_lock("nightly", Duration::from_millis(20)),
        );
        let (winner, loser) = match (a, b) {
            (Ok(guard), Err(e)) | (Err(e), Ok(guard)) => (guard, e),
            _ => panic!("exactly one local caller should hold the lock"),
        };
        assert!(matches!(
            loser,
            TableCacheError::Usage(UsageError::RecursiveLock { .. })
        ));
        assert!(!winner.was_forced());
        winner.release().await.unwrap();
    }
}
