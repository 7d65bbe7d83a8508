//! Folio Core - Cache Data Types
//!
//! Pure data structures shared by the cache engine and its callers: keys,
//! content pointers, entry and stats records, configuration and the error
//! taxonomy. No I/O lives here.

pub mod config;
pub mod entities;
pub mod error;
pub mod identity;
pub mod key;

pub use config::CacheConfig;
pub use entities::{
    is_asset_content_type, CacheEntry, CacheLookup, FetchResult, GlobalStats, InvalidationReport,
    SourceStats, StatsView,
};
pub use error::{
    CacheError, CacheResult, CacheWriteError, ConfigError, CorruptionError, IoError, StorageError,
    ValidationError,
};
pub use identity::{compute_key_digest, ByteSize, KeyDigest, Timestamp};
pub use key::{validate_component, CacheKey, ContentPointer};
