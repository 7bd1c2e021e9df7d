//! Read-Through Table Tests
//!
//! Queries served from the store on a miss and from the cache afterwards;
//! submitted changes reaching both; store failures evicting touched keys.

use std::sync::Arc;

use tablecache_storage::{
    CacheTransport, DocumentStore, InMemoryDocumentStore, ReadThroughTable, TableCache,
};
use tablecache_test_utils::{
    all_transports, genre_is, longer_than, Book, CacheableEntity, ChangeSet, FaultyTransport,
    OrderBy, TableCacheConfig, TableCacheError,
};
use tablecache_core::TrackedEntity;

fn seeded_store() -> Arc<InMemoryDocumentStore> {
    let store = Arc::new(InMemoryDocumentStore::new());
    store.create_table("Books", Book::schema());
    store
}

async fn seed(store: &InMemoryDocumentStore, books: &[Book]) {
    for book in books {
        store.put_item("Books", &book.document()).await.unwrap();
    }
}

fn table(
    transport: Arc<dyn CacheTransport>,
    store: Arc<InMemoryDocumentStore>,
) -> ReadThroughTable<Book, InMemoryDocumentStore> {
    let cache = Arc::new(TableCache::new(transport, TableCacheConfig::default()).unwrap());
    ReadThroughTable::new(cache, store, "Books", None).unwrap()
}

#[tokio::test]
async fn test_query_builds_then_hits() {
    for t in all_transports() {
        let store = seeded_store();
        seed(
            &store,
            &[
                Book::new("b1", "ann", 300, "sf"),
                Book::new("b2", "bob", 100, "sf"),
                Book::new("b3", "cy", 200, "crime"),
            ],
        )
        .await;
        let books = table(t.transport.clone(), store.clone());
        let order = OrderBy::descending("pages");

        let first = books.query(&genre_is("sf"), Some(&order)).await.unwrap();
        assert_eq!(first.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(), ["b1", "b2"]);
        assert_eq!(books.cache().stats().misses, 1, "{}", t.name);

        // Served from the index even though the store changed underneath
        store.delete_item("Books", &Book::new("b2", "", 0, "").key()).await.unwrap();
        let second = books.query(&genre_is("sf"), Some(&order)).await.unwrap();
        assert_eq!(second, first, "{}", t.name);
        assert_eq!(books.cache().stats().hits, 1, "{}", t.name);
        assert_eq!(books.count(&genre_is("sf")).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn test_get_caches_loaded_entity() {
    for t in all_transports() {
        let store = seeded_store();
        let b1 = Book::new("b1", "ann", 300, "sf");
        seed(&store, &[b1.clone()]).await;
        let books = table(t.transport.clone(), store.clone());

        assert_eq!(books.get(&b1.key()).await.unwrap(), Some(b1.clone()));
        store.delete_item("Books", &b1.key()).await.unwrap();
        assert_eq!(books.get(&b1.key()).await.unwrap(), Some(b1.clone()), "{}", t.name);
        assert_eq!(books.get(&Book::new("zz", "", 0, "").key()).await.unwrap(), None);

        let many = books
            .get_many(&[Book::new("zz", "", 0, "").key(), b1.key()])
            .await
            .unwrap();
        assert_eq!(many, vec![b1]);
    }
}

#[tokio::test]
async fn test_submit_patches_cached_queries() {
    for t in all_transports() {
        let store = seeded_store();
        seed(&store, &[Book::new("b1", "ann", 300, "sf")]).await;
        let books = table(t.transport.clone(), store.clone());
        assert_eq!(books.count(&longer_than(150)).await.unwrap(), 1);

        let changes = ChangeSet::new()
            .add(Book::new("b2", "bob", 400, "sf").document())
            .modify(Book::new("b1", "ann", 100, "sf").document());
        books.submit(&changes).await.unwrap();

        assert_eq!(store.item_count("Books"), 2);
        let long = books.query(&longer_than(150), None).await.unwrap();
        assert_eq!(long.len(), 1, "{}", t.name);
        assert_eq!(long[0].id, "b2");
        // The second query was a hit
        assert_eq!(books.cache().stats().hits, 1, "{}", t.name);
    }
}

#[tokio::test]
async fn test_projected_query() {
    for t in all_transports() {
        let store = seeded_store();
        seed(&store, &[Book::new("b1", "ann", 300, "sf")]).await;
        let books = table(t.transport.clone(), store);
        let fields = vec!["author".to_string()];

        let first = books
            .query_projected(&genre_is("sf"), &fields, None)
            .await
            .unwrap();
        let second = books
            .query_projected(&genre_is("sf"), &fields, None)
            .await
            .unwrap();
        assert_eq!(first, second, "{}", t.name);
        assert_eq!(first[0].len(), 2);
        assert_eq!(books.cache().stats().hits, 1, "{}", t.name);
    }
}

#[tokio::test]
async fn test_store_failure_evicts_touched_keys() {
    for t in all_transports() {
        let store = seeded_store();
        let b1 = Book::new("b1", "ann", 300, "sf");
        seed(&store, &[b1.clone()]).await;
        let books = table(t.transport.clone(), store.clone());
        books.get(&b1.key()).await.unwrap();

        store.set_fail_writes(true);
        let err = books
            .submit(&ChangeSet::new().modify(Book::new("b1", "ann", 1, "sf").document()))
            .await
            .unwrap_err();
        assert!(matches!(err, TableCacheError::Store(_)), "{}", t.name);
        assert!(books.cache().get_single_entity(&b1.key()).await.unwrap().is_none());
        store.set_fail_writes(false);

        // Next read goes back to the store
        assert_eq!(books.get(&b1.key()).await.unwrap(), Some(b1));
    }
}

#[tokio::test]
async fn test_unavailable_cache_falls_back_to_store() {
    for t in all_transports() {
        let store = seeded_store();
        seed(&store, &[Book::new("b1", "ann", 300, "sf")]).await;
        let faulty = Arc::new(FaultyTransport::new(t.transport.clone()));
        let books = table(faulty.clone(), store);

        faulty.fail_next_transient(100);
        let found = books.query(&genre_is("sf"), None).await.unwrap();
        assert_eq!(found.len(), 1, "{}", t.name);
        faulty.clear_faults();
    }
}

#[tokio::test]
async fn test_submit_tracked() {
    for t in all_transports() {
        let store = seeded_store();
        let books = table(t.transport.clone(), store.clone());

        let mut tracked = vec![
            TrackedEntity::added(Book::new("b1", "ann", 10, "sf")),
            TrackedEntity::added(Book::new("b2", "bob", 20, "sf")),
        ];
        books.submit_tracked(&mut tracked).await.unwrap();
        assert_eq!(store.item_count("Books"), 2, "{}", t.name);

        tracked[0].get_mut().pages = 11;
        tracked[1].mark_deleted();
        books.submit_tracked(&mut tracked).await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(store.item_count("Books"), 1, "{}", t.name);
        let b1 = books.get(&tracked[0].get().key()).await.unwrap().unwrap();
        assert_eq!(b1.pages, 11);
    }
}

#[tokio::test]
async fn test_second_binding_is_rejected() {
    let store = seeded_store();
    let transport: Arc<dyn CacheTransport> = Arc::new(tablecache_storage::HashMapTransport::new());
    let cache = Arc::new(TableCache::new(transport, TableCacheConfig::default()).unwrap());
    let _books = ReadThroughTable::<Book, _>::new(cache.clone(), store.clone(), "Books", None).unwrap();
    assert!(ReadThroughTable::<Book, _>::new(cache, store, "Other", None).is_err());
}
