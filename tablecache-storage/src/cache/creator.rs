//! Index creation.
//!
//! A build is optimistic: [`TableCache::start_creating_index`] writes a
//! "being rebuilt" placeholder and remembers its version. The caller feeds
//! every store result through [`IndexCreator::add_entity`], then
//! [`IndexCreator::commit`] publishes the finished index only if nothing
//! touched the placeholder in between. Any write that lands in the scope
//! meanwhile bumps that version, so the build loses and the next query
//! rebuilds.
//!
//! [`TableCache::start_creating_index`]: super::TableCache::start_creating_index

use std::collections::BTreeSet;

use tablecache_core::entity::project_document;
use tablecache_core::{Document, EntityKey, SearchConditions, TableCacheResult};
use tracing::{debug, warn};

use super::engine::TableCache;
use super::index::{CachedIndex, CachedProjectionIndex, IndexEntry};
use super::transport::{CacheTransport, VersionToken};

/// How a build ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The index is live.
    Published,
    /// A concurrent write or build changed the placeholder; nothing was
    /// published.
    Superseded,
    /// The build could not be completed and its placeholder was removed.
    Discarded,
}

enum Build {
    Full {
        conditions: SearchConditions,
        members: BTreeSet<EntityKey>,
    },
    Projection {
        conditions: SearchConditions,
        fields: Vec<String>,
        documents: Vec<Document>,
    },
}

/// An index build in progress.
pub struct IndexCreator<'a> {
    cache: &'a TableCache,
    index_key: String,
    token: VersionToken,
    build: Build,
    failed: bool,
    finished: bool,
}

impl<'a> IndexCreator<'a> {
    /// Write the placeholder, register it, and confirm it is still ours.
    ///
    /// Any failure is swallowed: the caller simply does not cache.
    pub(crate) async fn start(
        cache: &'a TableCache,
        index_key: String,
        list_key: String,
        placeholder: IndexEntry,
    ) -> Option<IndexCreator<'a>> {
        match Self::try_start(cache, &index_key, list_key, &placeholder).await {
            Ok(Some(token)) => {
                let build = match placeholder {
                    IndexEntry::Full(index) => Build::Full {
                        conditions: index.conditions,
                        members: BTreeSet::new(),
                    },
                    IndexEntry::Projection(index) => Build::Projection {
                        conditions: index.conditions,
                        fields: index.fields,
                        documents: Vec::new(),
                    },
                };
                Some(IndexCreator {
                    cache,
                    index_key,
                    token,
                    build,
                    failed: false,
                    finished: false,
                })
            }
            Ok(None) => {
                debug!(index_key = %index_key, "Index build lost the start race");
                remove_quietly(cache, &index_key).await;
                None
            }
            Err(e) => {
                warn!(index_key = %index_key, error = %e, "Could not start index build");
                remove_quietly(cache, &index_key).await;
                None
            }
        }
    }

    async fn try_start(
        cache: &TableCache,
        index_key: &str,
        list_key: String,
        placeholder: &IndexEntry,
    ) -> TableCacheResult<Option<VersionToken>> {
        let ttl = cache.config.entry_ttl;
        let written = placeholder.encode()?;
        if !cache.transport.set(index_key, &written, ttl).await? {
            return Ok(None);
        }
        if !cache.index_list(list_key).register(index_key).await? {
            return Ok(None);
        }
        let Some((bytes, token)) = cache.transport.get_with_version(index_key).await? else {
            return Ok(None);
        };
        // Byte comparison: decoded operands need not round-trip exactly
        if bytes == written && IndexEntry::decode(&bytes)?.is_fresh_build() {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    pub fn index_key(&self) -> &str {
        &self.index_key
    }

    /// Whether the build has already been marked as failed.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Feed one store result. Returns `false` once the build has failed;
    /// the caller may stop feeding.
    pub async fn add_entity(&mut self, document: &Document) -> bool {
        if self.failed {
            return false;
        }
        let Ok(binding) = self.cache.binding() else {
            self.failed = true;
            return false;
        };
        match &mut self.build {
            Build::Full { members, .. } => {
                let key = match binding.schema.key_of(document) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!(index_key = %self.index_key, error = %e, "Result has no usable key");
                        self.failed = true;
                        return false;
                    }
                };
                let Some(cache_key) = binding.keys.entity(&key) else {
                    debug!(index_key = %self.index_key, key = %key, "Member key too long, build abandoned");
                    self.failed = true;
                    return false;
                };
                let bytes = match serde_json::to_vec(document) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        self.failed = true;
                        return false;
                    }
                };
                // A newer cached version is never overwritten by a read
                match self
                    .cache
                    .transport
                    .add_if_absent(&cache_key, &bytes, self.cache.config.entry_ttl)
                    .await
                {
                    Ok(stored) => {
                        if stored {
                            self.cache.stats.entity_writes(1);
                        }
                        members.insert(key);
                        true
                    }
                    Err(e) => {
                        warn!(index_key = %self.index_key, error = %e, "Entity write failed during build");
                        self.failed = true;
                        false
                    }
                }
            }
            Build::Projection {
                fields, documents, ..
            } => {
                documents.push(project_document(&binding.schema, document, fields));
                true
            }
        }
    }

    /// Publish the index if the placeholder is still untouched.
    pub async fn commit(mut self) -> TableCacheResult<CommitOutcome> {
        self.finished = true;
        if self.failed {
            let message = format!("Index build for {} discarded", self.index_key);
            debug!(index_key = %self.index_key, "Index build discarded");
            self.cache.report(&message);
            remove_quietly(self.cache, &self.index_key).await;
            return Ok(CommitOutcome::Discarded);
        }

        let build = std::mem::replace(
            &mut self.build,
            Build::Full {
                conditions: SearchConditions::new(),
                members: BTreeSet::new(),
            },
        );
        let entry = match build {
            Build::Full {
                conditions,
                members,
            } => IndexEntry::Full(CachedIndex {
                being_rebuilt: false,
                members,
                conditions,
            }),
            Build::Projection {
                conditions,
                fields,
                documents,
            } => IndexEntry::Projection(CachedProjectionIndex {
                being_rebuilt: false,
                documents,
                conditions,
                fields,
            }),
        };

        let bytes = entry.encode()?;
        match self
            .cache
            .transport
            .replace_if_version_matches(
                &self.index_key,
                &bytes,
                self.cache.config.entry_ttl,
                self.token,
            )
            .await
        {
            Ok(true) => {
                self.cache.stats.index_write();
                debug!(index_key = %self.index_key, "Index published");
                Ok(CommitOutcome::Published)
            }
            Ok(false) => {
                debug!(index_key = %self.index_key, "Index build superseded");
                Ok(CommitOutcome::Superseded)
            }
            Err(e) => {
                remove_quietly(self.cache, &self.index_key).await;
                Err(e.into())
            }
        }
    }

    /// Give up on the build and remove its placeholder.
    pub async fn abandon(mut self) {
        self.finished = true;
        remove_quietly(self.cache, &self.index_key).await;
    }
}

impl Drop for IndexCreator<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                index_key = %self.index_key,
                "Index build dropped without commit or abandon; placeholder stays until it expires or is rebuilt"
            );
        }
    }
}

async fn remove_quietly(cache: &TableCache, index_key: &str) {
    if let Err(e) = cache.transport.remove(index_key).await {
        warn!(index_key = %index_key, error = %e, "Failed to remove index placeholder");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::transport::HashMapTransport;
    use serde_json::json;
    use tablecache_core::{EntitySchema, ScanOperator, TableCacheConfig};

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn cache_with_limit(limit: usize) -> TableCache {
        let transport = Arc::new(HashMapTransport::with_key_length_limit(limit));
        let cache = TableCache::new(transport, TableCacheConfig::default()).unwrap();
        cache
            .initialize("Books", EntitySchema::new("Book", "id"), None)
            .unwrap();
        cache
    }

    fn conditions() -> SearchConditions {
        SearchConditions::new().with("pages", ScanOperator::GreaterThan, vec![json!(0)])
    }

    #[tokio::test]
    async fn test_empty_build_publishes_empty_index() {
        let cache = cache_with_limit(250);
        let creator = cache.start_creating_index(&conditions()).await.unwrap().unwrap();
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Published);
        assert_eq!(cache.get_count(&conditions()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_unreadable_while_building() {
        let cache = cache_with_limit(250);
        let creator = cache.start_creating_index(&conditions()).await.unwrap().unwrap();
        assert!(cache.get_entities(&conditions(), None, None).await.unwrap().is_none());
        creator.abandon().await;
        assert!(cache.get_count(&conditions()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_member_discards_build() {
        let cache = cache_with_limit(64);
        let mut creator = cache.start_creating_index(&conditions()).await.unwrap().unwrap();
        assert!(creator.add_entity(&doc(json!({"id": "ok", "pages": 1}))).await);
        let long = "x".repeat(80);
        assert!(!creator.add_entity(&doc(json!({"id": long, "pages": 1}))).await);
        assert!(creator.has_failed());
        let index_key = creator.index_key().to_string();
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Discarded);
        assert!(cache.transport.get(&index_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_build_supersedes_older() {
        let cache = cache_with_limit(250);
        let mut first = cache.start_creating_index(&conditions()).await.unwrap().unwrap();
        first.add_entity(&doc(json!({"id": "a", "pages": 1}))).await;
        let second = cache.start_creating_index(&conditions()).await.unwrap().unwrap();
        assert_eq!(first.commit().await.unwrap(), CommitOutcome::Superseded);
        assert_eq!(second.commit().await.unwrap(), CommitOutcome::Published);
        assert_eq!(cache.get_count(&conditions()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_projection_build() {
        let cache = cache_with_limit(250);
        let fields = vec!["title".to_string()];
        let mut creator = cache
            .start_creating_projection_index(&conditions(), &fields)
            .await
            .unwrap()
            .unwrap();
        creator
            .add_entity(&doc(json!({"id": "a", "pages": 3, "title": "Dune"})))
            .await;
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Published);
        let docs = cache
            .get_entities(&conditions(), Some(&fields), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(docs, vec![doc(json!({"id": "a", "title": "Dune"}))]);
    }
}
