//! TABLECACHE Storage - Cache Engine, Transports and Read-Through Table
//!
//! The index cache-coherence engine and everything it talks to: the cache
//! transport contract with its LMDB and in-memory backends, the backing
//! document store contract, and a typed read-through table tying both
//! together.

pub mod cache;
pub mod read_through;
pub mod store;

// Re-export the engine surface
pub use cache::{
    CacheEvents, CacheKeys, CacheStats, CacheTransport, CachedIndex, CachedProjectionIndex,
    CommitOutcome, HashMapTransport, IndexCreator, IndexEntry, IndexScope, LmdbTransport,
    LmdbTransportError, NoopEvents, Precondition, RetryingTransport, TableCache,
    TableLockGuard, Transaction, TransactionOp, VersionToken,
};
pub use read_through::ReadThroughTable;
pub use store::{DocumentStore, InMemoryDocumentStore};
