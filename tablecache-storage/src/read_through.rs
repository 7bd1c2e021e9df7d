//! Read-through table.
//!
//! Wires a [`TableCache`] to its [`DocumentStore`] for one typed entity:
//! queries are answered from a cached index when one is healthy, otherwise
//! from the store while building the index; writes go to the store first and
//! are then applied to the cache.

use std::marker::PhantomData;
use std::sync::Arc;

use tablecache_core::{
    from_document, project_document, CacheableEntity, ChangeSet, Document, EntityKey,
    EntityState, KeyValue, OrderBy, SearchConditions, TableCacheError, TableCacheResult,
    TrackedEntity,
};
use tracing::{debug, warn};

use crate::cache::{CommitOutcome, IndexCreator, TableCache};
use crate::store::DocumentStore;

/// Typed cache-plus-store access to one table.
pub struct ReadThroughTable<E, S> {
    cache: Arc<TableCache>,
    store: Arc<S>,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S> ReadThroughTable<E, S>
where
    E: CacheableEntity,
    S: DocumentStore,
{
    /// Bind the cache to `table` and wrap it.
    pub fn new(
        cache: Arc<TableCache>,
        store: Arc<S>,
        table: &str,
        partition: Option<KeyValue>,
    ) -> TableCacheResult<Self> {
        cache.initialize(table, E::schema(), partition)?;
        Ok(Self {
            cache,
            store,
            _entity: PhantomData,
        })
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn table(&self) -> TableCacheResult<&str> {
        self.cache.table()
    }

    /// Fetch one entity, caching it on a miss.
    pub async fn get(&self, key: &EntityKey) -> TableCacheResult<Option<E>> {
        if let Some(document) = fallback(self.cache.get_single_entity(key).await)? {
            return Ok(Some(from_document(document)?));
        }
        let Some(document) = self.store.get_item(self.table()?, key).await? else {
            return Ok(None);
        };
        if let Err(e) = self.cache.put_single_loaded_entity(key, &document).await {
            warn!(key = %key, error = %e, "Could not cache loaded entity");
        }
        Ok(Some(from_document(document)?))
    }

    /// Fetch several entities. Missing keys are skipped; order follows
    /// `keys`.
    pub async fn get_many(&self, keys: &[EntityKey]) -> TableCacheResult<Vec<E>> {
        let mut found: Vec<Option<Document>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            let cached = fallback(self.cache.get_single_entity(key).await)?;
            if cached.is_none() {
                missing.push(key.clone());
            }
            found.push(cached);
        }

        if !missing.is_empty() {
            let schema = self.cache.schema()?;
            let loaded = self.store.batch_get(self.table()?, &missing).await?;
            for document in loaded {
                let key = schema.key_of(&document)?;
                if let Err(e) = self.cache.put_single_loaded_entity(&key, &document).await {
                    warn!(key = %key, error = %e, "Could not cache loaded entity");
                }
                if let Some(slot) = keys.iter().position(|k| *k == key) {
                    found[slot] = Some(document);
                }
            }
        }

        found
            .into_iter()
            .flatten()
            .map(from_document)
            .collect()
    }

    /// Entities matching `conditions`.
    pub async fn query(
        &self,
        conditions: &SearchConditions,
        order: Option<&OrderBy>,
    ) -> TableCacheResult<Vec<E>> {
        let cached = fallback(self.cache.get_entities(conditions, None, order).await)?;
        let documents = match cached {
            Some(documents) => documents,
            None => {
                let creator = fallback(self.cache.start_creating_index(conditions).await)?;
                let mut documents = self.load_building(conditions, creator).await?;
                if let Some(order) = order {
                    self.cache.sort_documents(&mut documents, order)?;
                }
                documents
            }
        };
        documents.into_iter().map(from_document).collect()
    }

    /// Projected documents of the entities matching `conditions`. Key fields
    /// are always included.
    pub async fn query_projected(
        &self,
        conditions: &SearchConditions,
        fields: &[String],
        order: Option<&OrderBy>,
    ) -> TableCacheResult<Vec<Document>> {
        if let Some(documents) =
            fallback(self.cache.get_entities(conditions, Some(fields), order).await)?
        {
            return Ok(documents);
        }
        let creator = fallback(
            self.cache
                .start_creating_projection_index(conditions, fields)
                .await,
        )?;
        let schema = self.cache.schema()?;
        let mut documents: Vec<Document> = self
            .load_building(conditions, creator)
            .await?
            .iter()
            .map(|d| project_document(schema, d, fields))
            .collect();
        if let Some(order) = order {
            self.cache.sort_documents(&mut documents, order)?;
        }
        Ok(documents)
    }

    /// Number of entities matching `conditions`.
    pub async fn count(&self, conditions: &SearchConditions) -> TableCacheResult<usize> {
        if let Some(count) = fallback(self.cache.get_count(conditions).await)? {
            return Ok(count);
        }
        let creator = fallback(self.cache.start_creating_index(conditions).await)?;
        Ok(self.load_building(conditions, creator).await?.len())
    }

    /// Query the store, feeding the results into an index build if one was
    /// started.
    async fn load_building(
        &self,
        conditions: &SearchConditions,
        creator: Option<IndexCreator<'_>>,
    ) -> TableCacheResult<Vec<Document>> {
        let partition = self.cache.partition()?;
        let documents = match self.store.query(self.table()?, partition, conditions).await {
            Ok(documents) => documents,
            Err(e) => {
                if let Some(creator) = creator {
                    creator.abandon().await;
                }
                return Err(e);
            }
        };

        if let Some(mut creator) = creator {
            for document in &documents {
                if !creator.add_entity(document).await {
                    break;
                }
            }
            match creator.commit().await {
                Ok(CommitOutcome::Published) => {}
                Ok(outcome) => debug!(?outcome, "Index not published"),
                Err(e) => warn!(error = %e, "Index commit failed"),
            }
        }
        Ok(documents)
    }

    /// Write a change set to the store, then to the cache.
    ///
    /// If the store rejects any write, every touched key is evicted from the
    /// entity cache and the store error is returned.
    pub async fn submit(&self, changes: &ChangeSet) -> TableCacheResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_store(changes).await {
            let touched = changes.touched_keys(self.cache.schema()?);
            if let Err(evict) = self.cache.remove_entities(&touched).await {
                warn!(error = %evict, "Could not evict entities after store failure");
            }
            return Err(e);
        }
        self.cache.apply_changes(changes).await
    }

    async fn write_store(&self, changes: &ChangeSet) -> TableCacheResult<()> {
        let table = self.table()?;
        for document in changes.added.iter().chain(changes.modified.iter()) {
            self.store.put_item(table, document).await?;
        }
        for key in &changes.removed {
            self.store.delete_item(table, key).await?;
        }
        Ok(())
    }

    /// Submit the pending changes of tracked entities and mark the survivors
    /// as synced. Deleted entities are dropped from `tracked`.
    pub async fn submit_tracked(&self, tracked: &mut Vec<TrackedEntity<E>>) -> TableCacheResult<()> {
        let changes = ChangeSet::from_tracked(tracked.as_slice())?;
        self.submit(&changes).await?;
        let mut kept = Vec::with_capacity(tracked.len());
        for mut entity in tracked.drain(..) {
            if entity.state()? != EntityState::Deleted {
                entity.mark_synced()?;
                kept.push(entity);
            }
        }
        *tracked = kept;
        Ok(())
    }
}

/// Treat a cache transport failure on the read path as a miss.
fn fallback<T>(result: TableCacheResult<Option<T>>) -> TableCacheResult<Option<T>> {
    match result {
        Err(TableCacheError::Transport(e)) => {
            warn!(error = %e, "Cache unavailable, reading from store");
            Ok(None)
        }
        other => other,
    }
}
