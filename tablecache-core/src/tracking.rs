//! Change tracking for typed entities.
//!
//! A [`TrackedEntity`] remembers the document it was last synced with; its
//! state is derived by diffing the current document against that snapshot.
//! [`ChangeSet`] is the added/modified/removed triple handed to the cache
//! write path.

use serde::{Deserialize, Serialize};

use crate::entity::{to_document, CacheableEntity};
use crate::{Document, EntityKey, EntitySchema, TableCacheResult};

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never synced with the store.
    Added,
    /// Differs from the last synced snapshot.
    Modified,
    Unchanged,
    /// Marked for deletion.
    Deleted,
}

/// A typed entity plus its last-synced snapshot.
#[derive(Debug, Clone)]
pub struct TrackedEntity<E> {
    entity: E,
    snapshot: Option<Document>,
    deleted: bool,
}

impl<E: CacheableEntity> TrackedEntity<E> {
    /// Track a new entity that the store has not seen.
    pub fn added(entity: E) -> Self {
        Self {
            entity,
            snapshot: None,
            deleted: false,
        }
    }

    /// Track an entity freshly loaded from the store.
    pub fn loaded(entity: E) -> TableCacheResult<Self> {
        let snapshot = to_document(&entity)?;
        Ok(Self {
            entity,
            snapshot: Some(snapshot),
            deleted: false,
        })
    }

    pub fn get(&self) -> &E {
        &self.entity
    }

    pub fn get_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn into_inner(self) -> E {
        self.entity
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Current state, by structural diff against the snapshot.
    pub fn state(&self) -> TableCacheResult<EntityState> {
        if self.deleted {
            return Ok(EntityState::Deleted);
        }
        match &self.snapshot {
            None => Ok(EntityState::Added),
            Some(snapshot) => {
                if &to_document(&self.entity)? == snapshot {
                    Ok(EntityState::Unchanged)
                } else {
                    Ok(EntityState::Modified)
                }
            }
        }
    }

    /// Record the current value as synced.
    pub fn mark_synced(&mut self) -> TableCacheResult<()> {
        self.snapshot = Some(to_document(&self.entity)?);
        Ok(())
    }

    fn snapshot_key(&self, schema: &EntitySchema) -> TableCacheResult<Option<EntityKey>> {
        match &self.snapshot {
            Some(snapshot) => Ok(Some(schema.key_of(snapshot)?)),
            None => Ok(None),
        }
    }
}

/// Entities added, modified and removed in one write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<Document>,
    pub modified: Vec<Document>,
    pub removed: Vec<EntityKey>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, document: Document) -> Self {
        self.added.push(document);
        self
    }

    pub fn modify(mut self, document: Document) -> Self {
        self.modified.push(document);
        self
    }

    pub fn remove(mut self, key: EntityKey) -> Self {
        self.removed.push(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Collect the pending changes of a set of tracked entities.
    ///
    /// A modification that changes the entity key is recorded as removal of
    /// the old key plus addition of the new document. Entities added and
    /// deleted before ever syncing produce nothing.
    pub fn from_tracked<E: CacheableEntity>(tracked: &[TrackedEntity<E>]) -> TableCacheResult<Self> {
        let schema = E::schema();
        let mut changes = ChangeSet::new();
        for entity in tracked {
            match entity.state()? {
                EntityState::Unchanged => {}
                EntityState::Added => changes.added.push(to_document(entity.get())?),
                EntityState::Deleted => {
                    if let Some(key) = entity.snapshot_key(&schema)? {
                        changes.removed.push(key);
                    }
                }
                EntityState::Modified => {
                    let document = to_document(entity.get())?;
                    let new_key = schema.key_of(&document)?;
                    match entity.snapshot_key(&schema)? {
                        Some(old_key) if old_key != new_key => {
                            changes.removed.push(old_key);
                            changes.added.push(document);
                        }
                        _ => changes.modified.push(document),
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Every key this change set touches.
    pub fn touched_keys(&self, schema: &EntitySchema) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .filter_map(|d| schema.key_of(d).ok())
            .collect();
        keys.extend(self.removed.iter().cloned());
        keys.sort();
        keys.dedup();
        keys
    }
}
