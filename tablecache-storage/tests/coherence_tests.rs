//! Index Coherence Tests
//!
//! Every scenario runs against both cache backends. Each one checks a single
//! guarantee of the cache:
//!
//! - a committed index reads back its members;
//! - a deleted entity never comes back through an index;
//! - a removed or unlisted index entry is never served or recreated;
//! - an index under construction is invisible;
//! - a write during a build makes the build lose;
//! - of two parallel builds, the later one wins;
//! - a read never overwrites a locally written entity;
//! - counts follow incremental writes;
//! - projection indexes die on any write that could affect them;
//! - an index a write cannot patch is dropped from cache and list;
//! - the index list evicts its oldest entry past capacity;
//! - a failed entity batch removes itself and its scopes' indexes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tablecache_storage::{CacheKeys, CacheTransport, CommitOutcome, IndexScope, TableCache};
use tablecache_test_utils::{
    all_transports, bound_cache, genre_is, init_test_tracing, longer_than, Book, CacheableEntity,
    Document, EntityKey, FaultyTransport, KeyValue, OrderBy, Review, ScanOperator,
    SearchConditions, TableCacheConfig,
};

// ============================================================================
// HELPERS
// ============================================================================

fn books_cache(transport: Arc<dyn CacheTransport>) -> TableCache {
    bound_cache(transport, "Books", Book::schema(), None)
}

async fn build(cache: &TableCache, conditions: &SearchConditions, books: &[Book]) -> CommitOutcome {
    let mut creator = cache
        .start_creating_index(conditions)
        .await
        .unwrap()
        .expect("index build starts");
    for book in books {
        assert!(creator.add_entity(&book.document()).await);
    }
    creator.commit().await.unwrap()
}

async fn ids(cache: &TableCache, conditions: &SearchConditions) -> Option<Vec<String>> {
    cache
        .get_entities(conditions, None, Some(&OrderBy::ascending("id")))
        .await
        .unwrap()
        .map(|docs| {
            docs.iter()
                .map(|d| d["id"].as_str().unwrap_or_default().to_string())
                .collect()
        })
}

async fn build_projection(
    cache: &TableCache,
    conditions: &SearchConditions,
    fields: &[String],
) -> CommitOutcome {
    let mut creator = cache
        .start_creating_projection_index(conditions, fields)
        .await
        .unwrap()
        .expect("projection build starts");
    creator
        .add_entity(&Book::new("b1", "ann", 10, "sf").document())
        .await;
    creator.commit().await.unwrap()
}

async fn cached(
    cache: &TableCache,
    conditions: &SearchConditions,
    fields: &[String],
) -> Option<Vec<Document>> {
    cache
        .get_entities(conditions, Some(fields), None)
        .await
        .unwrap()
}

fn docs(books: &[&Book]) -> Vec<Document> {
    books.iter().map(|b| b.document()).collect()
}

/// Index key and list key of a whole-table Books index.
fn index_keys(cache: &TableCache, conditions: &SearchConditions) -> (String, String) {
    let keys = CacheKeys::new("Books", cache.key_limit());
    (
        keys.index(&IndexScope::Table, conditions).unwrap(),
        keys.index_list(&IndexScope::Table).unwrap(),
    )
}

async fn is_listed(
    transport: &dyn CacheTransport,
    cache: &TableCache,
    conditions: &SearchConditions,
) -> bool {
    let (index_key, list_key) = index_keys(cache, conditions);
    match transport.get(&list_key).await.unwrap() {
        Some(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)
            .unwrap()
            .contains(&index_key),
        None => false,
    }
}

async fn entry_present(
    transport: &dyn CacheTransport,
    cache: &TableCache,
    conditions: &SearchConditions,
) -> bool {
    let (index_key, _) = index_keys(cache, conditions);
    transport.get(&index_key).await.unwrap().is_some()
}

/// The index is gone from the cache, from its list, and from reads.
async fn assert_dropped(
    transport: &dyn CacheTransport,
    cache: &TableCache,
    conditions: &SearchConditions,
    backend: &str,
) {
    assert_eq!(cache.get_count(conditions).await.unwrap(), None, "{}", backend);
    assert!(!is_listed(transport, cache, conditions).await, "{}", backend);
    assert!(!entry_present(transport, cache, conditions).await, "{}", backend);
}

// ============================================================================
// READ PATH
// ============================================================================

#[tokio::test]
async fn test_read_after_build() {
    init_test_tracing();
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        assert_eq!(ids(&cache, &sf).await, None, "{}", t.name);

        let books = [Book::new("b2", "ann", 300, "sf"), Book::new("b1", "bob", 120, "sf")];
        assert_eq!(build(&cache, &sf, &books).await, CommitOutcome::Published);

        assert_eq!(
            ids(&cache, &sf).await,
            Some(vec!["b1".to_string(), "b2".to_string()]),
            "{}",
            t.name
        );
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(2), "{}", t.name);
        let stats = cache.stats();
        assert!(stats.hits >= 2 && stats.misses >= 1, "{}", t.name);
    }
}

#[tokio::test]
async fn test_projection_read_includes_key_fields() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let fields = vec!["title".to_string()];
        let sf = genre_is("sf");
        let mut creator = cache
            .start_creating_projection_index(&sf, &fields)
            .await
            .unwrap()
            .unwrap();
        creator
            .add_entity(&Book::new("b1", "ann", 10, "sf").document())
            .await;
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Published);

        let docs = cache
            .get_entities(&sf, Some(&fields), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(docs.len(), 1, "{}", t.name);
        let keys: Vec<&String> = docs[0].keys().collect();
        assert_eq!(keys.len(), 2, "{}", t.name);
        assert!(docs[0].contains_key("id") && docs[0].contains_key("title"));
        // The full index was never built
        assert!(cache.get_entities(&sf, None, None).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_deleted_member_leaves_index() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let b1 = Book::new("b1", "ann", 10, "sf");
        let b2 = Book::new("b2", "bob", 20, "sf");
        build(&cache, &sf, &[b1.clone(), b2.clone()]).await;

        cache
            .update_cache_and_indexes(&[], &[], &[b1.key()])
            .await
            .unwrap();
        assert_eq!(ids(&cache, &sf).await, Some(vec!["b2".to_string()]), "{}", t.name);
        assert!(cache.get_single_entity(&b1.key()).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_removed_index_entry_is_not_recreated() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        build(&cache, &sf, &[Book::new("b1", "ann", 10, "sf")]).await;

        // The entry expires while its list still names it
        let (index_key, _) = index_keys(&cache, &sf);
        assert!(t.transport.remove(&index_key).await.unwrap());
        assert!(is_listed(t.transport.as_ref(), &cache, &sf).await);

        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b2", "bob", 20, "sf")]), &[], &[])
            .await
            .unwrap();
        assert!(!entry_present(t.transport.as_ref(), &cache, &sf).await, "{}", t.name);
        assert_eq!(ids(&cache, &sf).await, None, "{}", t.name);
        assert_eq!(cache.get_count(&sf).await.unwrap(), None, "{}", t.name);
    }
}

#[tokio::test]
async fn test_unlisted_index_entry_is_not_served() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        build(&cache, &sf, &[Book::new("b1", "ann", 10, "sf")]).await;

        let (_, list_key) = index_keys(&cache, &sf);
        t.transport
            .set(&list_key, b"[]", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(entry_present(t.transport.as_ref(), &cache, &sf).await);

        assert_eq!(ids(&cache, &sf).await, None, "{}", t.name);
        assert_eq!(cache.get_count(&sf).await.unwrap(), None, "{}", t.name);
    }
}

#[tokio::test]
async fn test_evicted_member_drops_index() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let b1 = Book::new("b1", "ann", 10, "sf");
        build(&cache, &sf, &[b1.clone(), Book::new("b2", "bob", 20, "sf")]).await;

        // Entity cache loses a member behind the index's back
        assert_eq!(cache.remove_entities(&[b1.key()]).await.unwrap(), 1);
        assert_eq!(ids(&cache, &sf).await, None, "{}", t.name);
        // The index is gone for good, not just skipped once
        assert_eq!(cache.get_count(&sf).await.unwrap(), None, "{}", t.name);
    }
}

// ============================================================================
// BUILD PROTOCOL
// ============================================================================

#[tokio::test]
async fn test_build_isolation() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let mut creator = cache.start_creating_index(&sf).await.unwrap().unwrap();
        creator
            .add_entity(&Book::new("b1", "ann", 10, "sf").document())
            .await;
        assert_eq!(ids(&cache, &sf).await, None, "{}", t.name);
        assert_eq!(cache.get_count(&sf).await.unwrap(), None, "{}", t.name);
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Published);
        assert_eq!(ids(&cache, &sf).await, Some(vec!["b1".to_string()]));
    }
}

#[tokio::test]
async fn test_concurrent_write_makes_build_lose() {
    for t in all_transports() {
        let builder = books_cache(t.transport.clone());
        let writer = books_cache(t.transport.clone());
        let sf = genre_is("sf");

        let mut creator = builder.start_creating_index(&sf).await.unwrap().unwrap();
        creator
            .add_entity(&Book::new("b1", "ann", 10, "sf").document())
            .await;

        // Another process adds a matching book the build never saw
        writer
            .update_cache_and_indexes(&docs(&[&Book::new("b9", "cy", 99, "sf")]), &[], &[])
            .await
            .unwrap();

        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Superseded, "{}", t.name);
        assert_eq!(ids(&builder, &sf).await, None, "{}", t.name);

        // The next build publishes normally
        let all = [Book::new("b1", "ann", 10, "sf"), Book::new("b9", "cy", 99, "sf")];
        assert_eq!(build(&builder, &sf, &all).await, CommitOutcome::Published);
        assert_eq!(builder.get_count(&sf).await.unwrap(), Some(2));
    }
}

#[tokio::test]
async fn test_later_parallel_build_wins() {
    for t in all_transports() {
        let first = books_cache(t.transport.clone());
        let second = books_cache(t.transport.clone());
        let sf = genre_is("sf");

        let mut older = first.start_creating_index(&sf).await.unwrap().unwrap();
        older
            .add_entity(&Book::new("old", "ann", 10, "sf").document())
            .await;
        let mut newer = second.start_creating_index(&sf).await.unwrap().unwrap();
        newer
            .add_entity(&Book::new("new", "bob", 10, "sf").document())
            .await;

        assert_eq!(newer.commit().await.unwrap(), CommitOutcome::Published, "{}", t.name);
        assert_eq!(older.commit().await.unwrap(), CommitOutcome::Superseded, "{}", t.name);
        assert_eq!(ids(&first, &sf).await, Some(vec!["new".to_string()]));
    }
}

#[tokio::test]
async fn test_read_never_overwrites_local_change() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let fresh = Book::new("b1", "ann", 999, "sf");
        cache
            .update_cache_and_indexes(&[], &docs(&[&fresh]), &[])
            .await
            .unwrap();

        // A slow store read of the old version lands afterwards
        let stale = Book::new("b1", "ann", 10, "sf");
        assert!(!cache
            .put_single_loaded_entity(&stale.key(), &stale.document())
            .await
            .unwrap());
        build(&cache, &genre_is("sf"), &[stale]).await;

        let cached = cache.get_single_entity(&fresh.key()).await.unwrap().unwrap();
        assert_eq!(cached["pages"], serde_json::json!(999), "{}", t.name);
    }
}

#[tokio::test]
async fn test_inexact_float_operand_is_cacheable() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        // Does not survive a JSON round trip bit for bit
        let tiny = SearchConditions::new().with(
            "pages",
            ScanOperator::GreaterThan,
            vec![json!(1.0715660391465826e-75)],
        );
        let outcome = build(&cache, &tiny, &[Book::new("b1", "ann", 10, "sf")]).await;
        assert_eq!(outcome, CommitOutcome::Published, "{}", t.name);
        assert_eq!(cache.get_count(&tiny).await.unwrap(), Some(1), "{}", t.name);
    }
}

#[tokio::test]
async fn test_oversized_member_discards_build() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let mut creator = cache.start_creating_index(&sf).await.unwrap().unwrap();
        let huge = Book::new(&"x".repeat(400), "ann", 10, "sf");
        assert!(!creator.add_entity(&huge.document()).await);
        assert_eq!(creator.commit().await.unwrap(), CommitOutcome::Discarded, "{}", t.name);
        assert_eq!(ids(&cache, &sf).await, None);
    }
}

// ============================================================================
// WRITE PATH
// ============================================================================

#[tokio::test]
async fn test_incremental_counts() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        assert_eq!(build(&cache, &sf, &[]).await, CommitOutcome::Published);
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(0), "{}", t.name);

        let b1 = Book::new("b1", "ann", 10, "sf");
        let b2 = Book::new("b2", "bob", 20, "sf");
        cache
            .update_cache_and_indexes(&docs(&[&b1]), &[], &[])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(1), "{}", t.name);

        cache
            .update_cache_and_indexes(&docs(&[&b2]), &[], &[])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(2), "{}", t.name);

        cache
            .update_cache_and_indexes(&[], &[], &[b1.key()])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(1), "{}", t.name);

        // Modified out of the index
        let b2_crime = Book::new("b2", "bob", 20, "crime");
        cache
            .update_cache_and_indexes(&[], &docs(&[&b2_crime]), &[])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(0), "{}", t.name);

        // Non-matching writes leave the index alone
        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b3", "cy", 5, "poetry")]), &[], &[])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(0), "{}", t.name);
    }
}

#[tokio::test]
async fn test_patch_applies_to_every_listed_index() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let long = longer_than(100);
        build(&cache, &sf, &[]).await;
        build(&cache, &long, &[]).await;

        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b1", "ann", 500, "sf")]), &[], &[])
            .await
            .unwrap();
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(1), "{}", t.name);
        assert_eq!(cache.get_count(&long).await.unwrap(), Some(1), "{}", t.name);
    }
}

#[tokio::test]
async fn test_projection_dropped_on_any_affecting_write() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        let fields = vec!["title".to_string()];
        build_projection(&cache, &sf, &fields).await;
        // A non-matching addition cannot change the result
        cache
            .update_cache_and_indexes(&docs(&[&Book::new("p1", "cy", 5, "poetry")]), &[], &[])
            .await
            .unwrap();
        assert!(cached(&cache, &sf, &fields).await.is_some(), "{}", t.name);

        // A matching addition drops it
        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b2", "bob", 5, "sf")]), &[], &[])
            .await
            .unwrap();
        assert!(cached(&cache, &sf, &fields).await.is_none(), "{}", t.name);

        // Any modification drops it, even of a non-matching entity
        build_projection(&cache, &sf, &fields).await;
        assert!(cached(&cache, &sf, &fields).await.is_some());
        cache
            .update_cache_and_indexes(&[], &docs(&[&Book::new("p1", "cy", 6, "poetry")]), &[])
            .await
            .unwrap();
        assert!(cached(&cache, &sf, &fields).await.is_none(), "{}", t.name);

        // Any removal drops it
        build_projection(&cache, &sf, &fields).await;
        cache
            .update_cache_and_indexes(&[], &[], &[EntityKey::new("p1")])
            .await
            .unwrap();
        assert!(cached(&cache, &sf, &fields).await.is_none(), "{}", t.name);
    }
}

#[tokio::test]
async fn test_unevaluable_write_drops_index() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let long = longer_than(5);
        build(&cache, &long, &[Book::new("b1", "ann", 10, "sf")]).await;

        let mut odd = Book::new("b9", "cy", 1, "sf").document();
        odd.insert("pages".to_string(), json!("many"));
        cache.update_cache_and_indexes(&[odd], &[], &[]).await.unwrap();

        assert_dropped(t.transport.as_ref(), &cache, &long, &t.name).await;
    }
}

#[tokio::test]
async fn test_uncompilable_index_dropped_on_write() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let one_bound = SearchConditions::new().with("pages", ScanOperator::Between, vec![json!(1)]);
        assert_eq!(build(&cache, &one_bound, &[]).await, CommitOutcome::Published);
        assert_eq!(cache.get_count(&one_bound).await.unwrap(), Some(0));

        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b1", "ann", 10, "sf")]), &[], &[])
            .await
            .unwrap();
        assert_dropped(t.transport.as_ref(), &cache, &one_bound, &t.name).await;
    }
}

#[tokio::test]
async fn test_uncacheable_matching_write_drops_index() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        let sf = genre_is("sf");
        build(&cache, &sf, &[]).await;

        let huge = Book::new(&"x".repeat(400), "ann", 10, "sf");
        cache
            .update_cache_and_indexes(&docs(&[&huge]), &[], &[])
            .await
            .unwrap();
        assert_dropped(t.transport.as_ref(), &cache, &sf, &t.name).await;
    }
}

#[tokio::test]
async fn test_patch_losing_every_race_drops_index() {
    for t in all_transports() {
        let faulty = Arc::new(FaultyTransport::new(t.transport.clone()));
        let cache = books_cache(faulty.clone());
        let sf = genre_is("sf");
        build(&cache, &sf, &[Book::new("b1", "ann", 10, "sf")]).await;

        faulty.lose_every_replace(true);
        cache
            .update_cache_and_indexes(&docs(&[&Book::new("b2", "bob", 20, "sf")]), &[], &[])
            .await
            .unwrap();
        faulty.clear_faults();

        assert_dropped(t.transport.as_ref(), &cache, &sf, &t.name).await;
    }
}

#[tokio::test]
async fn test_index_list_capacity_evicts_oldest() {
    for t in all_transports() {
        let config = TableCacheConfig::default().with_max_indexes_per_table(2);
        let cache = TableCache::new(t.transport.clone(), config).unwrap();
        cache.initialize("Books", Book::schema(), None).unwrap();

        let (a, b, c) = (genre_is("sf"), genre_is("crime"), genre_is("poetry"));
        build(&cache, &a, &[]).await;
        build(&cache, &b, &[]).await;
        build(&cache, &c, &[]).await;

        assert_eq!(cache.get_count(&a).await.unwrap(), None, "{}", t.name);
        assert_eq!(cache.get_count(&b).await.unwrap(), Some(0), "{}", t.name);
        assert_eq!(cache.get_count(&c).await.unwrap(), Some(0), "{}", t.name);
    }
}

#[tokio::test]
async fn test_failed_entity_batch_is_compensated() {
    for t in all_transports() {
        let faulty = Arc::new(FaultyTransport::new(t.transport.clone()));
        let cache = books_cache(faulty.clone());
        let sf = genre_is("sf");
        let b1 = Book::new("b1", "ann", 10, "sf");
        cache
            .update_cache_and_indexes(&docs(&[&b1]), &[], &[])
            .await
            .unwrap();
        build(&cache, &sf, &[b1.clone()]).await;
        assert_eq!(cache.get_count(&sf).await.unwrap(), Some(1));

        faulty.fail_writes_matching(":e:sb2");
        let b1_changed = Book::new("b1", "ann", 11, "sf");
        let b2 = Book::new("b2", "bob", 20, "sf");
        cache
            .update_cache_and_indexes(&docs(&[&b2]), &docs(&[&b1_changed]), &[])
            .await
            .unwrap();
        faulty.clear_faults();

        // Nothing of the batch survives, and no index claims to know better
        assert!(cache.get_single_entity(&b1.key()).await.unwrap().is_none(), "{}", t.name);
        assert!(cache.get_single_entity(&b2.key()).await.unwrap().is_none(), "{}", t.name);
        assert_eq!(cache.get_count(&sf).await.unwrap(), None, "{}", t.name);
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    for t in all_transports() {
        let faulty = Arc::new(FaultyTransport::new(t.transport.clone()));
        let cache = books_cache(faulty.clone());
        let b1 = Book::new("b1", "ann", 10, "sf");
        cache
            .update_cache_and_indexes(&docs(&[&b1]), &[], &[])
            .await
            .unwrap();

        faulty.fail_next_transient(2);
        assert!(cache.get_single_entity(&b1.key()).await.unwrap().is_some(), "{}", t.name);

        // More failures than the retry budget surface as an error
        faulty.fail_next_transient(10);
        let err = cache.get_single_entity(&b1.key()).await.unwrap_err();
        assert!(err.is_transient(), "{}", t.name);
        faulty.clear_faults();
    }
}

// ============================================================================
// PARTITION SCOPES
// ============================================================================

#[tokio::test]
async fn test_table_wide_write_patches_partition_index() {
    for t in all_transports() {
        let partition = bound_cache(
            t.transport.clone(),
            "Reviews",
            Review::schema(),
            Some(KeyValue::string("b1")),
        );
        let table = bound_cache(t.transport.clone(), "Reviews", Review::schema(), None);
        let good = SearchConditions::new().with(
            "stars",
            tablecache_test_utils::ScanOperator::GreaterThanOrEqual,
            vec![serde_json::json!(4)],
        );
        let mut creator = partition.start_creating_index(&good).await.unwrap().unwrap();
        creator.add_entity(&Review::new("b1", 1, 5).document()).await;
        creator.commit().await.unwrap();

        table
            .update_cache_and_indexes(
                &[Review::new("b1", 2, 4).document(), Review::new("b2", 1, 5).document()],
                &[],
                &[],
            )
            .await
            .unwrap();
        // Only the b1 review belongs to the partition
        assert_eq!(partition.get_count(&good).await.unwrap(), Some(2), "{}", t.name);
    }
}

#[tokio::test]
async fn test_partition_write_patches_table_index() {
    for t in all_transports() {
        let partition = bound_cache(
            t.transport.clone(),
            "Reviews",
            Review::schema(),
            Some(KeyValue::string("b1")),
        );
        let table = bound_cache(t.transport.clone(), "Reviews", Review::schema(), None);
        let all = SearchConditions::new();
        let creator = table.start_creating_index(&all).await.unwrap().unwrap();
        creator.commit().await.unwrap();

        partition
            .update_cache_and_indexes(&[Review::new("b1", 7, 3).document()], &[], &[])
            .await
            .unwrap();
        assert_eq!(table.get_count(&all).await.unwrap(), Some(1), "{}", t.name);
    }
}

// ============================================================================
// LOCKS AND MISUSE
// ============================================================================

#[tokio::test]
async fn test_lock_exclusivity_and_forced_takeover() {
    for t in all_transports() {
        let first = books_cache(t.transport.clone());
        let second = books_cache(t.transport.clone());

        let held = first
            .acquire_table_lock("reindex", Duration::from_millis(30))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let taken = second
            .acquire_table_lock("reindex", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30), "{}", t.name);
        assert!(taken.was_forced());

        let err = held.release().await.unwrap_err();
        assert!(matches!(
            err,
            tablecache_test_utils::TableCacheError::Usage(
                tablecache_core::UsageError::LockStolen { .. }
            )
        ));
        taken.release().await.unwrap();
    }
}

#[tokio::test]
async fn test_reinitialize_is_rejected() {
    for t in all_transports() {
        let cache = books_cache(t.transport.clone());
        assert!(cache.initialize("Books", Book::schema(), None).is_ok());
        assert!(cache.initialize("Reviews", Review::schema(), None).is_err());
    }
}
