//! Index list: the registry of live indexes for one scope.
//!
//! An index whose key is not in its list does not exist, whatever the
//! transport still holds under that key. The list is a JSON array of index
//! keys, oldest first, updated with version-guarded transactions.

use std::time::Duration;

use tablecache_core::TableCacheResult;

use super::transport::{CacheTransport, Precondition};

pub(crate) struct IndexList<'a> {
    transport: &'a dyn CacheTransport,
    key: String,
    capacity: usize,
    ttl: Duration,
    attempts: usize,
}

impl<'a> IndexList<'a> {
    pub(crate) fn new(
        transport: &'a dyn CacheTransport,
        key: String,
        capacity: usize,
        ttl: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            transport,
            key,
            capacity,
            ttl,
            attempts,
        }
    }

    /// Registered index keys, oldest first.
    pub(crate) async fn load(&self) -> TableCacheResult<Vec<String>> {
        match self.transport.get(&self.key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) async fn contains(&self, index_key: &str) -> TableCacheResult<bool> {
        Ok(self.load().await?.iter().any(|k| k == index_key))
    }

    /// Add a key if missing. Past capacity the oldest keys are evicted and
    /// their index entries removed in the same transaction.
    ///
    /// Returns `false` when every attempt lost a race.
    pub(crate) async fn register(&self, index_key: &str) -> TableCacheResult<bool> {
        for _ in 0..self.attempts {
            let current = self.transport.get_with_version(&self.key).await?;
            let (mut keys, precondition) = match current {
                Some((bytes, token)) => (
                    serde_json::from_slice::<Vec<String>>(&bytes)?,
                    Precondition::VersionMatches(self.key.clone(), token),
                ),
                None => (Vec::new(), Precondition::KeyAbsent(self.key.clone())),
            };
            if keys.iter().any(|k| k == index_key) {
                return Ok(true);
            }
            keys.push(index_key.to_string());
            let overflow = keys.len().saturating_sub(self.capacity);
            let evicted: Vec<String> = keys.drain(..overflow).collect();

            let mut txn = self
                .transport
                .begin_transaction()
                .add_precondition(precondition)
                .set(self.key.clone(), serde_json::to_vec(&keys)?, self.ttl);
            for key in &evicted {
                txn = txn.remove(key.clone());
            }
            if self.transport.execute(txn).await? {
                if !evicted.is_empty() {
                    tracing::debug!(
                        list = %self.key,
                        evicted = evicted.len(),
                        "Index list over capacity, evicted oldest indexes"
                    );
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop keys from the list. Returns `false` when every attempt lost a
    /// race.
    pub(crate) async fn remove(&self, index_keys: &[String]) -> TableCacheResult<bool> {
        for _ in 0..self.attempts {
            let Some((bytes, token)) = self.transport.get_with_version(&self.key).await? else {
                return Ok(true);
            };
            let keys: Vec<String> = serde_json::from_slice(&bytes)?;
            let kept: Vec<String> = keys
                .iter()
                .filter(|k| !index_keys.contains(*k))
                .cloned()
                .collect();
            if kept.len() == keys.len() {
                return Ok(true);
            }
            let txn = self
                .transport
                .begin_transaction()
                .add_precondition(Precondition::VersionMatches(self.key.clone(), token))
                .set(self.key.clone(), serde_json::to_vec(&kept)?, self.ttl);
            if self.transport.execute(txn).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
