//! Index cache-coherence layer.
//!
//! A [`TableCache`] keeps two kinds of data in a shared remote cache for one
//! table:
//!
//! - **entities**, one entry per key, written on every local change and on
//!   every store read;
//! - **indexes**, the key sets (or projected documents) of recent queries,
//!   registered in a bounded per-scope index list.
//!
//! Index entries are only ever served when they are listed, finished, and
//! fully resolvable. Builds are optimistic and lose to any concurrent write
//! in their scope; writes patch indexes under version checks and drop any
//! index they cannot keep provably consistent.
//!
//! # Example
//!
//! ```ignore
//! let cache = TableCache::new(Arc::new(HashMapTransport::new()), TableCacheConfig::default())?;
//! cache.initialize("Books", Book::schema(), None)?;
//!
//! match cache.get_entities(&conditions, None, None).await? {
//!     Some(books) => books,
//!     None => {
//!         let mut creator = cache.start_creating_index(&conditions).await?;
//!         let books = store.query("Books", None, &conditions).await?;
//!         if let Some(creator) = creator.as_mut() {
//!             for book in &books {
//!                 creator.add_entity(book).await;
//!             }
//!         }
//!         if let Some(creator) = creator {
//!             creator.commit().await?;
//!         }
//!         books
//!     }
//! }
//! ```

pub mod creator;
pub mod engine;
pub mod events;
pub mod index;
pub(crate) mod index_list;
pub mod keys;
pub mod table_lock;
pub mod transport;

pub use creator::{CommitOutcome, IndexCreator};
pub use engine::TableCache;
pub use events::{CacheEvents, CacheStats, NoopEvents};
pub use index::{CachedIndex, CachedProjectionIndex, IndexEntry};
pub use keys::{CacheKeys, IndexScope};
pub use table_lock::TableLockGuard;
pub use transport::{
    CacheTransport, HashMapTransport, LmdbTransport, LmdbTransportError, Precondition,
    RetryingTransport, Transaction, TransactionOp, VersionToken,
};
