//! Folio Storage - Document Cache Engine
//!
//! Durable local cache for documents and assets fetched from remote
//! repository sources:
//!
//! - [`index`]: LMDB metadata index holding entries, LRU orderings and
//!   per-source stats under one transaction boundary
//! - [`content`]: content-addressed blob tree with atomic publication
//! - [`coordinator`]: per-key serialization of mutations
//! - [`eviction`]: per-source and global LRU eviction with hysteresis
//! - [`sweep`]: startup reconciliation of index and blobs
//! - [`facade`]: the [`DocumentCache`] handle applications hold
//!
//! Logging goes through `tracing`; install a subscriber in the application
//! to see it.

pub mod clock;
pub mod content;
pub mod coordinator;
pub mod eviction;
pub mod facade;
pub mod index;
pub mod read_through;
pub mod sweep;

pub use clock::MonotonicClock;
pub use content::ContentStore;
pub use coordinator::KeyLocks;
pub use eviction::{EvictionReport, Evictor};
pub use facade::DocumentCache;
pub use index::MetadataIndex;
pub use read_through::{DocumentFetcher, FetchError, ServedDocument};
pub use sweep::{AuditReport, SweepReport};

// Re-export the data types callers need alongside the handle.
pub use folio_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheLookup, CacheResult, CacheWriteError,
    FetchResult, GlobalStats, InvalidationReport, SourceStats, StatsView,
};
