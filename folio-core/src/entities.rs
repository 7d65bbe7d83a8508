//! Core record structures

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identity::{ByteSize, Timestamp};
use crate::key::{CacheKey, ContentPointer};

/// Metadata for one cached document or asset.
///
/// The metadata index owns the lifecycle of these rows; the facade only
/// requests creation and removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub pointer: ContentPointer,
    pub size_bytes: ByteSize,
    pub fetched_at: Timestamp,
    pub accessed_at: Timestamp,
    pub content_type: String,
    pub is_asset: bool,
    /// Opaque revalidation token supplied by the fetch layer.
    pub validator: Option<String>,
}

impl CacheEntry {
    pub fn source_id(&self) -> &str {
        self.key.source_id()
    }
}

/// Aggregate bookkeeping for one source.
///
/// `total_size_bytes` always equals the sum of `size_bytes` over the
/// source's entries; the index re-establishes this inside the same
/// transaction as every entry mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: String,
    pub total_size_bytes: ByteSize,
    pub entry_count: u64,
    pub last_eviction_at: Option<Timestamp>,
}

impl SourceStats {
    /// Stats for a source with no entries.
    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            total_size_bytes: 0,
            entry_count: 0,
            last_eviction_at: None,
        }
    }

    /// Account for an entry joining the source.
    pub fn add(&mut self, size_bytes: ByteSize) {
        self.total_size_bytes = self.total_size_bytes.saturating_add(size_bytes);
        self.entry_count = self.entry_count.saturating_add(1);
    }

    /// Account for an entry leaving the source.
    pub fn subtract(&mut self, size_bytes: ByteSize) {
        self.total_size_bytes = self.total_size_bytes.saturating_sub(size_bytes);
        self.entry_count = self.entry_count.saturating_sub(1);
    }
}

/// Cache-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_size_bytes: ByteSize,
    pub entry_count: u64,
    pub source_count: u64,
    /// Number of cache hits since open.
    pub hits: u64,
    /// Number of cache misses since open.
    pub misses: u64,
    /// Number of entries removed by eviction since open.
    pub evictions: u64,
}

impl GlobalStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Answer to `stats(source?)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsView {
    Source(SourceStats),
    Global(GlobalStats),
}

/// Outcome of a cache lookup. Absence is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit { bytes: Vec<u8>, entry: CacheEntry },
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    /// Consume the lookup, keeping only the bytes of a hit.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            CacheLookup::Hit { bytes, .. } => Some(bytes),
            CacheLookup::Miss => None,
        }
    }
}

/// A document as delivered by the fetch layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub source_id: String,
    pub branch: String,
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub validator: Option<String>,
    pub fetched_at: Timestamp,
    pub is_asset: bool,
}

impl FetchResult {
    /// Build a fetch result stamped with the current time.
    ///
    /// `is_asset` is inferred from the content type; override the field when
    /// the fetch layer knows better.
    pub fn new(
        source_id: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        let content_type = content_type.into();
        Self {
            source_id: source_id.into(),
            branch: branch.into(),
            path: path.into(),
            is_asset: is_asset_content_type(&content_type),
            bytes,
            content_type,
            validator: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    /// Validated key of this result.
    pub fn key(&self) -> Result<CacheKey, ValidationError> {
        CacheKey::new(
            self.source_id.as_str(),
            self.branch.as_str(),
            self.path.as_str(),
        )
    }
}

/// Documents are text-like; everything else (images, fonts, archives) is an asset.
pub fn is_asset_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.starts_with("text/") {
        return false;
    }
    !matches!(
        essence.as_str(),
        "application/json"
            | "application/xml"
            | "application/xhtml+xml"
            | "application/yaml"
            | "application/x-yaml"
            | "application/toml"
            | "application/javascript"
    )
}

/// Result of an invalidation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub removed: u64,
    pub freed_bytes: ByteSize,
    /// Entries that could not be removed now; the next startup sweep
    /// repairs whatever they leave behind.
    pub deferred: u64,
}
