//! Read-through access on top of [`DocumentCache`].
//!
//! The fetch layer implements [`DocumentFetcher`]; `get_or_fetch` serves a
//! hit from disk and otherwise fetches, caches and returns the document.
//! Caching is best-effort here too: fetched bytes are returned even when
//! storing them fails.

use async_trait::async_trait;
use folio_core::{CacheEntry, CacheKey, CacheLookup, FetchResult};
use thiserror::Error;

use crate::facade::DocumentCache;

/// Errors raised by a [`DocumentFetcher`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Document not found: {key}")]
    NotFound { key: String },

    #[error("Fetch failed for {key}: {reason}")]
    Failed { key: String, reason: String },

    #[error("Fetcher returned {returned} for requested key {requested}")]
    KeyMismatch { requested: String, returned: String },
}

/// Source of documents on a cache miss, typically a network client.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Fetch the document stored under `key`.
    async fn fetch(&self, key: &CacheKey) -> Result<FetchResult, FetchError>;
}

/// A document served by [`DocumentCache::get_or_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedDocument {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Whether the bytes came from the cache rather than the fetcher.
    pub from_cache: bool,
    /// The cache row backing the bytes, if they are (now) cached.
    pub entry: Option<CacheEntry>,
}

impl DocumentCache {
    /// Serve `key` from the cache, fetching and caching it on a miss.
    pub async fn get_or_fetch<F>(&self, key: &CacheKey, fetcher: &F) -> Result<ServedDocument, FetchError>
    where
        F: DocumentFetcher + ?Sized,
    {
        if let CacheLookup::Hit { bytes, entry } = self.lookup(key).await {
            return Ok(ServedDocument {
                bytes,
                content_type: entry.content_type.clone(),
                from_cache: true,
                entry: Some(entry),
            });
        }

        let fetched = fetcher.fetch(key).await?;
        match fetched.key() {
            Ok(returned) if &returned == key => {}
            _ => {
                return Err(FetchError::KeyMismatch {
                    requested: key.to_string(),
                    returned: format!(
                        "{}@{}:{}",
                        fetched.source_id, fetched.branch, fetched.path
                    ),
                });
            }
        }

        let entry = match self.put_fetched(&fetched).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Serving fetched document without caching it");
                None
            }
        };

        Ok(ServedDocument {
            bytes: fetched.bytes,
            content_type: fetched.content_type,
            from_cache: false,
            entry,
        })
    }
}
