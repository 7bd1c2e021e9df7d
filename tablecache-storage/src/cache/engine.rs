//! Table cache engine.
//!
//! [`TableCache`] caches one table's entities and a bounded set of its query
//! result sets ("indexes") in a shared remote cache, keeping the indexes
//! coherent as entities change:
//!
//! - reads serve an index only if it exists, is listed in its index list,
//!   is not being rebuilt, and every member still resolves;
//! - writes apply to the entity cache all-or-nothing, then patch every
//!   listed index with version-guarded replaces, dropping any index whose
//!   consistency cannot be proven.
//!
//! There is no in-process lock around the cache; the transport's atomic
//! primitives are the only isolation.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::stream::{self, StreamExt};
use tablecache_core::entity::project_document;
use tablecache_core::{
    ChangeSet, ComparerCache, Document, EntityKey, EntitySchema, KeyValue, OrderBy,
    PredicateCache, SearchConditions, TableCacheConfig, TableCacheError, TableCacheResult,
    UsageError,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::creator::IndexCreator;
use super::events::{CacheEvents, CacheStats, NoopEvents, StatsCounters};
use super::index::{CachedIndex, CachedProjectionIndex, IndexEntry};
use super::index_list::IndexList;
use super::keys::{CacheKeys, IndexScope};
use super::transport::{CacheTransport, RetryingTransport};

/// What a table cache is bound to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Binding {
    pub(crate) table: String,
    pub(crate) schema: EntitySchema,
    pub(crate) partition: Option<KeyValue>,
    pub(crate) keys: CacheKeys,
}

impl Binding {
    fn describe(table: &str, schema: &EntitySchema, partition: Option<&KeyValue>) -> String {
        match partition {
            Some(p) => format!("{}<{}> partition {}", table, schema.entity_type(), p),
            None => format!("{}<{}>", table, schema.entity_type()),
        }
    }

    pub(crate) fn own_scope(&self) -> IndexScope {
        IndexScope::from_partition(self.partition.as_ref())
    }
}

/// One entry of a write batch after union.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub(crate) key: EntityKey,
    /// `None` when the key is too long to cache.
    pub(crate) cache_key: Option<String>,
    /// `None` for a removal.
    pub(crate) document: Option<Document>,
    pub(crate) was_added: bool,
}

/// Cache engine for one table.
pub struct TableCache {
    pub(crate) transport: RetryingTransport<Arc<dyn CacheTransport>>,
    pub(crate) config: TableCacheConfig,
    pub(crate) events: Arc<dyn CacheEvents>,
    binding: OnceLock<Binding>,
    predicates: PredicateCache,
    comparers: ComparerCache,
    /// Locks held by this engine: name -> token.
    pub(crate) held_locks: Mutex<HashMap<String, Uuid>>,
    pub(crate) stats: StatsCounters,
    key_limit: usize,
}

impl TableCache {
    /// Create an unbound table cache over a transport.
    pub fn new(
        transport: Arc<dyn CacheTransport>,
        config: TableCacheConfig,
    ) -> TableCacheResult<Self> {
        config.validate()?;
        let key_limit = config.max_key_length.min(transport.key_length_limit());
        Ok(Self {
            transport: RetryingTransport::new(transport, config.transport_retry_attempts),
            predicates: PredicateCache::new(config.predicate_cache_capacity),
            comparers: ComparerCache::new(),
            events: Arc::new(NoopEvents),
            binding: OnceLock::new(),
            held_locks: Mutex::new(HashMap::new()),
            stats: StatsCounters::default(),
            key_limit,
            config,
        })
    }

    /// Attach an events observer.
    pub fn with_events(mut self, events: Arc<dyn CacheEvents>) -> Self {
        self.events = events;
        self
    }

    /// Bind to a table, entity schema and optional fixed partition.
    ///
    /// Binding again to the same target is a no-op; binding to a different
    /// one is a usage error.
    pub fn initialize(
        &self,
        table: &str,
        schema: EntitySchema,
        partition: Option<KeyValue>,
    ) -> TableCacheResult<()> {
        let requested = Binding {
            table: table.to_string(),
            keys: CacheKeys::new(table, self.key_limit),
            schema,
            partition,
        };
        let bound = self.binding.get_or_init(|| requested.clone());
        if *bound == requested {
            debug!(table = %table, "Table cache bound");
            Ok(())
        } else {
            Err(UsageError::AlreadyInitialized {
                bound: Binding::describe(&bound.table, &bound.schema, bound.partition.as_ref()),
                requested: Binding::describe(
                    &requested.table,
                    &requested.schema,
                    requested.partition.as_ref(),
                ),
            }
            .into())
        }
    }

    pub(crate) fn binding(&self) -> TableCacheResult<&Binding> {
        self.binding
            .get()
            .ok_or_else(|| UsageError::NotInitialized.into())
    }

    pub fn table(&self) -> TableCacheResult<&str> {
        Ok(&self.binding()?.table)
    }

    pub fn schema(&self) -> TableCacheResult<&EntitySchema> {
        Ok(&self.binding()?.schema)
    }

    pub fn partition(&self) -> TableCacheResult<Option<&KeyValue>> {
        Ok(self.binding()?.partition.as_ref())
    }

    pub fn config(&self) -> &TableCacheConfig {
        &self.config
    }

    /// Effective maximum key length.
    pub fn key_limit(&self) -> usize {
        self.key_limit
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub(crate) fn index_list(&self, key: String) -> IndexList<'_> {
        IndexList::new(
            &self.transport,
            key,
            self.config.max_indexes_per_table,
            self.config.entry_ttl,
            self.config.max_update_attempts,
        )
    }

    pub(crate) fn report(&self, message: &str) {
        self.events.on_log(message);
    }

    fn hit(&self, table: &str) {
        self.stats.hit();
        self.events.on_hit(table);
    }

    fn miss(&self, table: &str) {
        self.stats.miss();
        self.events.on_miss(table);
    }

    /// Stable sort with the cached comparer for the bound entity type.
    pub fn sort_documents(&self, documents: &mut [Document], order: &OrderBy) -> TableCacheResult<()> {
        let binding = self.binding()?;
        self.comparers.sort(&binding.schema, order, documents);
        Ok(())
    }

    // ========================================================================
    // POINT LOOKUPS
    // ========================================================================

    /// Cached document for one key, if any.
    pub async fn get_single_entity(&self, key: &EntityKey) -> TableCacheResult<Option<Document>> {
        let binding = self.binding()?;
        let found = match binding.keys.entity(key) {
            Some(cache_key) => self.read_entity(&cache_key).await?,
            None => None,
        };
        match found {
            Some(document) => {
                self.hit(&binding.table);
                Ok(Some(document))
            }
            None => {
                self.miss(&binding.table);
                Ok(None)
            }
        }
    }

    /// Cache a document loaded from the store, unless the key is already
    /// cached. Returns whether it was stored.
    pub async fn put_single_loaded_entity(
        &self,
        key: &EntityKey,
        document: &Document,
    ) -> TableCacheResult<bool> {
        let binding = self.binding()?;
        let Some(cache_key) = binding.keys.entity(key) else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(document)?;
        let stored = self
            .transport
            .add_if_absent(&cache_key, &bytes, self.config.entry_ttl)
            .await?;
        if stored {
            self.stats.entity_writes(1);
        }
        Ok(stored)
    }

    /// Best-effort removal of entities from the entity cache. Returns how
    /// many were removed.
    pub async fn remove_entities(&self, keys: &[EntityKey]) -> TableCacheResult<usize> {
        let binding = self.binding()?;
        let cache_keys: Vec<String> = keys.iter().filter_map(|k| binding.keys.entity(k)).collect();
        let removed: Vec<bool> = stream::iter(cache_keys.iter())
            .map(move |cache_key| async move {
                match self.transport.remove(cache_key).await {
                    Ok(existed) => existed,
                    Err(e) => {
                        warn!(table = %binding.table, key = %cache_key, error = %e, "Failed to remove cached entity");
                        false
                    }
                }
            })
            .buffer_unordered(self.config.write_parallelism)
            .collect()
            .await;
        Ok(removed.into_iter().filter(|r| *r).count())
    }

    pub(crate) async fn read_entity(&self, cache_key: &str) -> TableCacheResult<Option<Document>> {
        match self.transport.get(cache_key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // QUERY PATH
    // ========================================================================

    /// Answer a query from a healthy cached index.
    ///
    /// `Ok(None)` means "go to the backing store".
    pub async fn get_entities(
        &self,
        conditions: &SearchConditions,
        projection: Option<&[String]>,
        order: Option<&OrderBy>,
    ) -> TableCacheResult<Option<Vec<Document>>> {
        let binding = self.binding()?;
        let scope = binding.own_scope();
        let Some(list_key) = binding.keys.index_list(&scope) else {
            self.miss(&binding.table);
            return Ok(None);
        };
        let list = self.index_list(list_key);

        let mut documents = None;
        if let Some(index_key) = binding.keys.index(&scope, conditions) {
            if let Some(IndexEntry::Full(index)) = self.load_healthy(&list, &index_key).await? {
                documents = self.resolve_members(binding, &list, &index_key, &index).await?;
                if let (Some(docs), Some(fields)) = (documents.as_mut(), projection) {
                    for doc in docs.iter_mut() {
                        *doc = project_document(&binding.schema, doc, fields);
                    }
                }
            }
        }

        if documents.is_none() {
            if let Some(fields) = projection {
                if let Some(index_key) = binding.keys.projection_index(&scope, conditions, fields) {
                    if let Some(IndexEntry::Projection(index)) =
                        self.load_healthy(&list, &index_key).await?
                    {
                        documents = Some(index.documents);
                    }
                }
            }
        }

        match documents {
            Some(mut docs) => {
                if let Some(order) = order {
                    self.comparers.sort(&binding.schema, order, &mut docs);
                }
                self.hit(&binding.table);
                Ok(Some(docs))
            }
            None => {
                self.miss(&binding.table);
                Ok(None)
            }
        }
    }

    /// Member count of a healthy full index, without materialising it.
    pub async fn get_count(&self, conditions: &SearchConditions) -> TableCacheResult<Option<usize>> {
        let binding = self.binding()?;
        let scope = binding.own_scope();
        let (Some(list_key), Some(index_key)) = (
            binding.keys.index_list(&scope),
            binding.keys.index(&scope, conditions),
        ) else {
            self.miss(&binding.table);
            return Ok(None);
        };
        let list = self.index_list(list_key);
        match self.load_healthy(&list, &index_key).await? {
            Some(IndexEntry::Full(index)) => {
                self.hit(&binding.table);
                Ok(Some(index.members.len()))
            }
            _ => {
                self.miss(&binding.table);
                Ok(None)
            }
        }
    }

    /// Read an index that exists, is listed and is not being rebuilt.
    async fn load_healthy(
        &self,
        list: &IndexList<'_>,
        index_key: &str,
    ) -> TableCacheResult<Option<IndexEntry>> {
        let Some(bytes) = self.transport.get(index_key).await? else {
            return Ok(None);
        };
        let entry = match IndexEntry::decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(index_key = %index_key, error = %e, "Undecodable index entry, ignoring");
                return Ok(None);
            }
        };
        if entry.being_rebuilt() || !list.contains(index_key).await? {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Resolve every member; a single miss drops the whole index.
    async fn resolve_members(
        &self,
        binding: &Binding,
        list: &IndexList<'_>,
        index_key: &str,
        index: &CachedIndex,
    ) -> TableCacheResult<Option<Vec<Document>>> {
        let mut cache_keys = Vec::with_capacity(index.members.len());
        for member in &index.members {
            match binding.keys.entity(member) {
                Some(cache_key) => cache_keys.push(cache_key),
                None => {
                    self.drop_indexes(binding, list, &[index_key.to_string()], "member key not cacheable")
                        .await;
                    return Ok(None);
                }
            }
        }

        let resolved: Vec<TableCacheResult<Option<Document>>> = stream::iter(cache_keys.iter())
            .map(|cache_key| self.read_entity(cache_key))
            .buffered(self.config.write_parallelism)
            .collect()
            .await;

        let mut documents = Vec::with_capacity(resolved.len());
        for result in resolved {
            match result? {
                Some(document) => documents.push(document),
                None => {
                    self.drop_indexes(binding, list, &[index_key.to_string()], "member missing from entity cache")
                        .await;
                    return Ok(None);
                }
            }
        }
        Ok(Some(documents))
    }

    // ========================================================================
    // INDEX CREATION
    // ========================================================================

    /// Begin building the full index for `conditions`.
    ///
    /// `Ok(None)` means the index cannot be cached right now; query the store
    /// without caching the result.
    pub async fn start_creating_index(
        &self,
        conditions: &SearchConditions,
    ) -> TableCacheResult<Option<IndexCreator<'_>>> {
        let binding = self.binding()?;
        let scope = binding.own_scope();
        let (Some(index_key), Some(list_key)) = (
            binding.keys.index(&scope, conditions),
            binding.keys.index_list(&scope),
        ) else {
            debug!(table = %binding.table, "Index key too long, not caching query");
            return Ok(None);
        };
        let entry = IndexEntry::Full(CachedIndex::rebuilding(conditions.clone()));
        Ok(IndexCreator::start(self, index_key, list_key, entry).await)
    }

    /// Begin building the projection index for `conditions` over `fields`.
    pub async fn start_creating_projection_index(
        &self,
        conditions: &SearchConditions,
        fields: &[String],
    ) -> TableCacheResult<Option<IndexCreator<'_>>> {
        let binding = self.binding()?;
        let scope = binding.own_scope();
        let (Some(index_key), Some(list_key)) = (
            binding.keys.projection_index(&scope, conditions, fields),
            binding.keys.index_list(&scope),
        ) else {
            debug!(table = %binding.table, "Projection index key too long, not caching query");
            return Ok(None);
        };
        let entry = IndexEntry::Projection(CachedProjectionIndex::rebuilding(
            conditions.clone(),
            fields.to_vec(),
        ));
        Ok(IndexCreator::start(self, index_key, list_key, entry).await)
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// [`update_cache_and_indexes`](Self::update_cache_and_indexes) for a
    /// change set.
    pub async fn apply_changes(&self, changes: &ChangeSet) -> TableCacheResult<()> {
        self.update_cache_and_indexes(&changes.added, &changes.modified, &changes.removed)
            .await
    }

    /// Apply a write batch to the entity cache, then patch every affected
    /// index.
    ///
    /// If any entity write fails, the whole batch is removed from the cache
    /// and every index in the affected scopes is dropped instead of patched.
    pub async fn update_cache_and_indexes(
        &self,
        added: &[Document],
        modified: &[Document],
        removed: &[EntityKey],
    ) -> TableCacheResult<()> {
        let binding = self.binding()?;
        let changes = self.union_changes(binding, added, modified, removed)?;
        if changes.is_empty() {
            return Ok(());
        }

        let scopes = affected_scopes(binding, &changes);

        if !self.apply_entity_changes(binding, &changes).await {
            return self.compensate_batch(binding, &changes, &scopes).await;
        }

        self.patch_scopes(binding, &changes, &scopes).await;
        Ok(())
    }

    fn union_changes(
        &self,
        binding: &Binding,
        added: &[Document],
        modified: &[Document],
        removed: &[EntityKey],
    ) -> TableCacheResult<Vec<PendingChange>> {
        let mut order: Vec<EntityKey> = Vec::new();
        let mut by_key: HashMap<EntityKey, PendingChange> = HashMap::new();
        let mut push = |change: PendingChange| {
            if !by_key.contains_key(&change.key) {
                order.push(change.key.clone());
            }
            by_key.insert(change.key.clone(), change);
        };

        for (documents, was_added) in [(added, true), (modified, false)] {
            for document in documents {
                let key = binding.schema.key_of(document)?;
                push(PendingChange {
                    cache_key: binding.keys.entity(&key),
                    key,
                    document: Some(document.clone()),
                    was_added,
                });
            }
        }
        for key in removed {
            push(PendingChange {
                cache_key: binding.keys.entity(key),
                key: key.clone(),
                document: None,
                was_added: false,
            });
        }

        Ok(order
            .into_iter()
            .filter_map(|key| by_key.remove(&key))
            .collect())
    }

    /// Write every cacheable change; stops dispatching after the first
    /// failure. Returns whether all writes landed.
    async fn apply_entity_changes(&self, binding: &Binding, changes: &[PendingChange]) -> bool {
        let stop = AtomicBool::new(false);
        let stop = &stop;
        let ttl = self.config.entry_ttl;
        let outcomes: Vec<bool> = stream::iter(
            changes
                .iter()
                .filter_map(|c| c.cache_key.as_ref().map(|k| (k, c))),
        )
        .map(move |(cache_key, change)| async move {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            let outcome = match &change.document {
                Some(document) => match serde_json::to_vec(document) {
                    Ok(bytes) => self
                        .transport
                        .set(cache_key, &bytes, ttl)
                        .await
                        .map_err(TableCacheError::from),
                    Err(e) => Err(e.into()),
                },
                None => self
                    .transport
                    .remove(cache_key)
                    .await
                    .map(|_| true)
                    .map_err(TableCacheError::from),
            };
            match outcome {
                Ok(true) => true,
                Ok(false) => {
                    stop.store(true, Ordering::SeqCst);
                    false
                }
                Err(e) => {
                    warn!(table = %binding.table, key = %cache_key, error = %e, "Entity cache write failed");
                    stop.store(true, Ordering::SeqCst);
                    false
                }
            }
        })
        .buffer_unordered(self.config.write_parallelism)
        .collect()
        .await;

        let applied = outcomes.iter().filter(|ok| **ok).count();
        self.stats.entity_writes(applied as u64);
        applied == outcomes.len()
    }

    /// Undo a partially applied batch: remove every entity of the batch and
    /// drop every index in the affected scopes.
    async fn compensate_batch(
        &self,
        binding: &Binding,
        changes: &[PendingChange],
        scopes: &[IndexScope],
    ) -> TableCacheResult<()> {
        let message = format!(
            "Entity cache batch of {} failed on {}, removing batch and dropping affected indexes",
            changes.len(),
            binding.table
        );
        warn!(table = %binding.table, batch = changes.len(), "Entity cache batch failed, compensating");
        self.report(&message);

        let mut doomed: Vec<String> = changes.iter().filter_map(|c| c.cache_key.clone()).collect();
        for scope in scopes {
            let Some(list_key) = binding.keys.index_list(scope) else {
                continue;
            };
            let list = self.index_list(list_key.clone());
            match list.load().await {
                Ok(index_keys) => {
                    self.stats.index_removals(index_keys.len() as u64);
                    doomed.extend(index_keys);
                }
                Err(e) => {
                    warn!(table = %binding.table, list = %list_key, error = %e, "Could not read index list while compensating");
                }
            }
            // Without its list every index of the scope is gone
            doomed.push(list_key);
        }
        self.transport.remove_many(&doomed).await?;
        Ok(())
    }

    /// Patch every listed index of every scope. Failed indexes are dropped.
    async fn patch_scopes(&self, binding: &Binding, changes: &[PendingChange], scopes: &[IndexScope]) {
        for scope in scopes {
            let in_scope: Vec<&PendingChange> =
                changes.iter().filter(|c| scope.contains(&c.key)).collect();
            if in_scope.is_empty() {
                continue;
            }
            let Some(list_key) = binding.keys.index_list(scope) else {
                continue;
            };
            let list = self.index_list(list_key);
            let index_keys = match list.load().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(table = %binding.table, error = %e, "Could not read index list, skipping patch");
                    continue;
                }
            };

            let in_scope = &in_scope;
            let failed: Vec<String> = stream::iter(index_keys.into_iter())
                .map(move |index_key| async move {
                    let ok = self.patch_index(binding, &index_key, in_scope).await;
                    (index_key, ok)
                })
                .buffer_unordered(self.config.write_parallelism)
                .filter_map(|(index_key, ok)| async move { (!ok).then_some(index_key) })
                .collect()
                .await;

            if !failed.is_empty() {
                self.drop_indexes(binding, &list, &failed, "patch could not prove consistency")
                    .await;
            }
        }
    }

    /// Patch one index. Returns `false` when it must be dropped.
    async fn patch_index(&self, binding: &Binding, index_key: &str, changes: &[&PendingChange]) -> bool {
        for _ in 0..self.config.max_update_attempts {
            let current = match self.transport.get_with_version(index_key).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(index_key = %index_key, error = %e, "Index read failed during patch");
                    return false;
                }
            };
            // Gone from the cache: nothing to patch and nothing to recreate
            let Some((bytes, token)) = current else {
                return true;
            };
            let entry = match IndexEntry::decode(&bytes) {
                Ok(entry) => entry,
                Err(_) => return false,
            };

            let updated = match entry {
                IndexEntry::Projection(index) => {
                    return self.projection_survives(binding, &index, changes);
                }
                IndexEntry::Full(index) if index.being_rebuilt => {
                    // Rewriting bumps the version so the open build cannot publish
                    index
                }
                IndexEntry::Full(mut index) => match self.patch_members(binding, &index, changes) {
                    MemberPatch::Unchanged => return true,
                    MemberPatch::Changed(members) => {
                        index.members = members;
                        index
                    }
                    MemberPatch::Unprovable(reason) => {
                        debug!(index_key = %index_key, reason = %reason, "Index cannot be patched");
                        return false;
                    }
                },
            };

            let bytes = match IndexEntry::Full(updated).encode() {
                Ok(bytes) => bytes,
                Err(_) => return false,
            };
            match self
                .transport
                .replace_if_version_matches(index_key, &bytes, self.config.entry_ttl, token)
                .await
            {
                Ok(true) => {
                    self.stats.index_write();
                    return true;
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(index_key = %index_key, error = %e, "Index replace failed during patch");
                    return false;
                }
            }
        }
        debug!(index_key = %index_key, "Index patch attempts exhausted");
        false
    }

    /// Membership after applying changes to a healthy full index.
    fn patch_members(
        &self,
        binding: &Binding,
        index: &CachedIndex,
        changes: &[&PendingChange],
    ) -> MemberPatch {
        let predicate = match self
            .predicates
            .get_or_compile(binding.schema.entity_type(), &index.conditions)
        {
            Ok(predicate) => predicate,
            Err(e) => return MemberPatch::Unprovable(e.to_string()),
        };
        let mut members = index.members.clone();
        let mut changed = false;
        for change in changes {
            let matches = match &change.document {
                Some(document) => match predicate.matches(document) {
                    Ok(matches) => matches,
                    Err(e) => return MemberPatch::Unprovable(e.to_string()),
                },
                None => false,
            };
            if matches {
                // A member the read path could never resolve
                if change.cache_key.is_none() {
                    return MemberPatch::Unprovable(format!("{} is not cacheable", change.key));
                }
                changed |= members.insert(change.key.clone());
            } else {
                changed |= members.remove(&change.key);
            }
        }
        if changed {
            MemberPatch::Changed(members)
        } else {
            MemberPatch::Unchanged
        }
    }

    /// Projection indexes survive only additions that do not match.
    fn projection_survives(
        &self,
        binding: &Binding,
        index: &CachedProjectionIndex,
        changes: &[&PendingChange],
    ) -> bool {
        let predicate = match self
            .predicates
            .get_or_compile(binding.schema.entity_type(), &index.conditions)
        {
            Ok(predicate) => predicate,
            Err(_) => return false,
        };
        changes.iter().all(|change| match (&change.document, change.was_added) {
            (Some(document), true) => matches!(predicate.matches(document), Ok(false)),
            _ => false,
        })
    }

    /// Remove indexes from the cache and from their list.
    pub(crate) async fn drop_indexes(
        &self,
        binding: &Binding,
        list: &IndexList<'_>,
        index_keys: &[String],
        reason: &str,
    ) {
        warn!(table = %binding.table, count = index_keys.len(), reason, "Dropping indexes");
        self.report(&format!(
            "Dropping {} index(es) on {}: {}",
            index_keys.len(),
            binding.table,
            reason
        ));
        if let Err(e) = self.transport.remove_many(index_keys).await {
            warn!(table = %binding.table, error = %e, "Failed to remove index entries");
        }
        match list.remove(index_keys).await {
            Ok(true) => {}
            Ok(false) => warn!(table = %binding.table, "Index list update kept losing races"),
            Err(e) => warn!(table = %binding.table, error = %e, "Failed to update index list"),
        }
        self.stats.index_removals(index_keys.len() as u64);
    }
}

enum MemberPatch {
    Unchanged,
    Changed(BTreeSet<EntityKey>),
    Unprovable(String),
}

/// Own scope plus the complementary one.
///
/// Unpartitioned caches also patch every partition touched by a range-keyed
/// entity; partitioned caches also patch the whole-table scope.
fn affected_scopes(binding: &Binding, changes: &[PendingChange]) -> Vec<IndexScope> {
    let mut scopes = vec![binding.own_scope()];
    match &binding.partition {
        Some(_) => scopes.push(IndexScope::Table),
        None => {
            let partitions: BTreeSet<&KeyValue> = changes
                .iter()
                .filter(|c| c.key.has_range())
                .map(|c| c.key.hash())
                .collect();
            scopes.extend(partitions.into_iter().map(|p| IndexScope::Partition(p.clone())));
        }
    }
    scopes
}
