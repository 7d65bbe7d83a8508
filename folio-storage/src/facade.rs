//! The public cache handle.
//!
//! [`DocumentCache`] ties the index, content store, key locks and evictor
//! together and owns the open/close lifecycle. Handles are cheap to clone and
//! share one underlying cache.
//!
//! # Write Path
//!
//! `put` takes the key lock, writes the blob (temp file, fsync, rename),
//! commits the index row and releases the lock. Eviction for the source,
//! then the global tier, runs afterwards as a background task; `settle`
//! waits for it.
//!
//! # Read Path
//!
//! `get` takes no lock. It reads the row, then the blob, and schedules a
//! best-effort `accessed_at` bump. A row whose blob is gone or truncated is
//! discarded and reported as a miss.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use folio_core::{
    is_asset_content_type, validate_component, ByteSize, CacheConfig, CacheEntry, CacheError,
    CacheKey, CacheLookup, CacheResult, CacheWriteError, FetchResult, GlobalStats,
    InvalidationReport, SourceStats, StatsView, StorageError, Timestamp, ValidationError,
};
use tokio::sync::Notify;

use crate::clock::MonotonicClock;
use crate::content::ContentStore;
use crate::coordinator::KeyLocks;
use crate::eviction::{EvictionReport, Evictor};
use crate::index::MetadataIndex;
use crate::sweep::{self, AuditReport, SweepReport};

/// Durable two-tier LRU cache of fetched documents and assets.
#[derive(Clone)]
pub struct DocumentCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<CacheConfig>,
    index: Arc<MetadataIndex>,
    content: ContentStore,
    clock: Arc<MonotonicClock>,
    key_locks: Arc<KeyLocks<CacheKey>>,
    evictor: Arc<Evictor>,
    background: Arc<BackgroundTasks>,
    hits: AtomicU64,
    misses: AtomicU64,
    closed: AtomicBool,
    sweep_report: SweepReport,
    startup_eviction: EvictionReport,
}

/// Everything a new entry needs besides its key and bytes.
struct NewEntry {
    content_type: String,
    validator: Option<String>,
    fetched_at: Option<Timestamp>,
    is_asset: bool,
}

struct Removed {
    size_bytes: ByteSize,
    blob_deleted: bool,
}

impl DocumentCache {
    /// Open the cache described by `config`.
    ///
    /// Runs the consistency sweep, and a full eviction pass if the caps
    /// shrank since the last run. An index that cannot be trusted is replaced
    /// by an empty one rather than failing the open.
    ///
    /// # Errors
    ///
    /// - `CacheError::Config` if the configuration is invalid
    /// - `CacheError::Io` if the data directory cannot be used
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let content = ContentStore::open(&config.content_dir()).await?;
        let (index, sweep_report) = open_consistent(&config, &content).await?;
        index.call(|index| index.mark_dirty()).await?;

        let clock = Arc::new(match index.call(|index| index.newest_access()).await? {
            Some(newest) => MonotonicClock::starting_after(newest),
            None => MonotonicClock::new(),
        });
        let key_locks = Arc::new(KeyLocks::new());
        let evictor = Arc::new(Evictor::new(
            Arc::clone(&index),
            content.clone(),
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::clone(&key_locks),
        ));
        let startup_eviction = evictor.evict_all().await?;

        let totals = index.call(|index| index.global_totals()).await?;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            entries = totals.entry_count,
            bytes = totals.total_size_bytes,
            sources = totals.source_count,
            "Document cache opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                index,
                content,
                clock,
                key_locks,
                evictor,
                background: Arc::new(BackgroundTasks::default()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                sweep_report,
                startup_eviction,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// What the startup sweep repaired.
    pub fn sweep_report(&self) -> SweepReport {
        self.inner.sweep_report
    }

    /// What the startup eviction pass removed.
    pub fn startup_eviction(&self) -> EvictionReport {
        self.inner.startup_eviction
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Look up a document. Never fails: anything that prevents serving the
    /// cached bytes is a miss.
    pub async fn get(&self, source_id: &str, branch: &str, path: &str) -> CacheLookup {
        match CacheKey::new(source_id, branch, path) {
            Ok(key) => self.lookup(&key).await,
            Err(e) => {
                tracing::debug!(source = %source_id, error = %e, "Invalid key treated as miss");
                CacheLookup::Miss
            }
        }
    }

    /// [`get`](Self::get) for an already validated key.
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let _active = self.inner.background.track();
        if self.is_closed() {
            return CacheLookup::Miss;
        }

        let lookup_key = key.clone();
        let mut entry = match self.inner.index.call(move |index| index.get(&lookup_key)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return self.miss(key),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Index lookup failed, treating as miss");
                return self.miss(key);
            }
        };

        match self.inner.content.read(&entry.pointer).await {
            Ok(Some(bytes)) if bytes.len() as u64 == entry.size_bytes => {
                let at = self.inner.clock.now();
                self.schedule_touch(key.clone(), at);
                entry.accessed_at = at;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, bytes = entry.size_bytes, "Cache hit");
                CacheLookup::Hit { bytes, entry }
            }
            Ok(found) => {
                tracing::warn!(
                    key = %key,
                    expected = entry.size_bytes,
                    found = ?found.map(|b| b.len()),
                    "Dropping entry with missing or truncated blob"
                );
                self.schedule_discard(entry);
                self.miss(key)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping entry with unreadable blob");
                self.schedule_discard(entry);
                self.miss(key)
            }
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a document, replacing any previous version under the same key.
    ///
    /// A failure here should not stop the caller from serving `bytes`.
    pub async fn put(
        &self,
        source_id: &str,
        branch: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        validator: Option<String>,
    ) -> Result<CacheEntry, CacheWriteError> {
        let key = CacheKey::new(source_id, branch, path)
            .map_err(|e| CacheWriteError::new(format!("{source_id}@{branch}:{path}"), e))?;
        let meta = NewEntry {
            content_type: content_type.to_string(),
            validator,
            fetched_at: None,
            is_asset: is_asset_content_type(content_type),
        };
        self.store(key, bytes, meta).await
    }

    /// Store a document exactly as delivered by the fetch layer, keeping its
    /// `fetched_at` and asset classification.
    pub async fn put_fetched(&self, fetched: &FetchResult) -> Result<CacheEntry, CacheWriteError> {
        let key = fetched.key().map_err(|e| {
            CacheWriteError::new(
                format!("{}@{}:{}", fetched.source_id, fetched.branch, fetched.path),
                e,
            )
        })?;
        let meta = NewEntry {
            content_type: fetched.content_type.clone(),
            validator: fetched.validator.clone(),
            fetched_at: Some(fetched.fetched_at),
            is_asset: fetched.is_asset,
        };
        self.store(key, &fetched.bytes, meta).await
    }

    async fn store(
        &self,
        key: CacheKey,
        bytes: &[u8],
        meta: NewEntry,
    ) -> Result<CacheEntry, CacheWriteError> {
        let label = key.to_string();
        let _active = self.inner.background.track();

        self.ensure_open()
            .map_err(|e| CacheWriteError::new(label.clone(), e))?;
        if bytes.is_empty() {
            return Err(CacheWriteError::new(label, ValidationError::EmptyContent));
        }

        let entry = self
            .inner
            .key_locks
            .with_key_lock(key.clone(), || self.write_locked(key, bytes, meta))
            .await
            .map_err(|e| CacheWriteError::new(label, e))?;

        self.schedule_eviction(entry.source_id().to_string());
        Ok(entry)
    }

    async fn write_locked(
        &self,
        key: CacheKey,
        bytes: &[u8],
        meta: NewEntry,
    ) -> CacheResult<CacheEntry> {
        let pointer = key.content_pointer();
        self.inner.content.write(&pointer, bytes).await?;

        let now = self.inner.clock.now();
        let entry = CacheEntry {
            key,
            pointer,
            size_bytes: bytes.len() as ByteSize,
            fetched_at: meta.fetched_at.unwrap_or(now),
            accessed_at: now,
            content_type: meta.content_type,
            is_asset: meta.is_asset,
            validator: meta.validator,
        };

        let row = entry.clone();
        match self.inner.index.call(move |index| index.upsert(&row)).await {
            Ok(replaced) => {
                tracing::debug!(
                    key = %entry.key,
                    bytes = entry.size_bytes,
                    replaced = replaced.is_some(),
                    "Stored entry"
                );
                Ok(entry)
            }
            Err(e) => {
                // The new blob may now sit under an old row; drop both.
                if let Err(cleanup) = self.inner.content.delete(&entry.pointer).await {
                    tracing::warn!(key = %entry.key, error = %cleanup, "Failed to remove blob after index failure");
                }
                let stale = entry.key.clone();
                if let Err(cleanup) = self.inner.index.call(move |index| index.remove(&stale)).await {
                    tracing::warn!(key = %entry.key, error = %cleanup, "Failed to remove stale row after index failure");
                }
                Err(e)
            }
        }
    }

    /// Remove every entry of a source, or of one branch of it.
    ///
    /// Tolerates partial failure: entries that cannot be removed now are
    /// counted as deferred, and the next startup sweep removes whatever they
    /// leave behind.
    pub async fn invalidate(
        &self,
        source_id: &str,
        branch: Option<&str>,
    ) -> CacheResult<InvalidationReport> {
        let _active = self.inner.background.track();
        self.ensure_open()?;
        validate_component("source_id", source_id)?;
        let prefix = match branch {
            Some(branch) => {
                validate_component("branch", branch)?;
                CacheKey::branch_prefix(source_id, branch)
            }
            None => CacheKey::source_prefix(source_id),
        };

        let entries = self
            .inner
            .index
            .call(move |index| index.entries_with_prefix(&prefix))
            .await?;

        let mut report = InvalidationReport::default();
        for entry in entries {
            let key = entry.key;
            match self
                .inner
                .key_locks
                .with_key_lock(key.clone(), || self.remove_entry(key.clone()))
                .await
            {
                Ok(Some(removed)) => {
                    report.removed += 1;
                    report.freed_bytes = report.freed_bytes.saturating_add(removed.size_bytes);
                    if !removed.blob_deleted {
                        report.deferred += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to invalidate entry");
                    report.deferred += 1;
                }
            }
        }

        if branch.is_none() {
            let source = source_id.to_string();
            if let Err(e) = self
                .inner
                .index
                .call(move |index| index.drop_source_if_empty(&source))
                .await
            {
                tracing::warn!(source = %source_id, error = %e, "Failed to drop source stats");
            }
        }

        if report.deferred > 0 {
            tracing::warn!(
                source = %source_id,
                branch = ?branch,
                deferred = report.deferred,
                "Invalidation incomplete, startup sweep will finish it"
            );
        }
        tracing::info!(
            source = %source_id,
            branch = ?branch,
            removed = report.removed,
            freed = report.freed_bytes,
            "Invalidated entries"
        );
        Ok(report)
    }

    async fn remove_entry(&self, key: CacheKey) -> CacheResult<Option<Removed>> {
        let blob_deleted = match self.inner.content.delete(&key.content_pointer()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Blob delete failed, leaving it to the sweep");
                false
            }
        };
        let removed = self.inner.index.call(move |index| index.remove(&key)).await?;
        Ok(removed.map(|entry| Removed {
            size_bytes: entry.size_bytes,
            blob_deleted,
        }))
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Stats for one source, or for the whole cache.
    pub async fn stats(&self, source_id: Option<&str>) -> CacheResult<StatsView> {
        match source_id {
            Some(source_id) => Ok(StatsView::Source(self.source_stats(source_id).await?)),
            None => Ok(StatsView::Global(self.global_stats().await?)),
        }
    }

    /// Stats for one source. A source with nothing cached reports zeros.
    pub async fn source_stats(&self, source_id: &str) -> CacheResult<SourceStats> {
        self.ensure_open()?;
        validate_component("source_id", source_id)?;
        let source = source_id.to_string();
        let stats = self
            .inner
            .index
            .call(move |index| index.source_stats(&source))
            .await?;
        Ok(stats.unwrap_or_else(|| SourceStats::empty(source_id)))
    }

    /// Cache-wide totals plus the hit/miss/eviction counters of this run.
    pub async fn global_stats(&self) -> CacheResult<GlobalStats> {
        self.ensure_open()?;
        let mut stats = self.inner.index.call(|index| index.global_totals()).await?;
        stats.hits = self.inner.hits.load(Ordering::Relaxed);
        stats.misses = self.inner.misses.load(Ordering::Relaxed);
        stats.evictions = self.inner.evictor.evictions();
        Ok(stats)
    }

    /// Check the index against the content tree without changing anything.
    pub async fn audit(&self) -> CacheResult<AuditReport> {
        self.ensure_open()?;
        sweep::audit(&self.inner.index, &self.inner.content).await
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Wait until every write, eviction pass and access-time bump started so
    /// far has finished.
    pub async fn settle(&self) {
        self.inner.background.settle().await;
    }

    /// Finish background work, record a clean shutdown and flush the index.
    ///
    /// Closing twice is a no-op. Afterwards writes and stats fail with
    /// `StorageError::Closed` and reads miss.
    pub async fn close(&self) -> CacheResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.background.settle().await;
        self.inner.index.call(|index| index.mark_clean()).await?;
        tracing::info!(data_dir = %self.inner.config.data_dir.display(), "Document cache closed");
        Ok(())
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            Err(StorageError::Closed.into())
        } else {
            Ok(())
        }
    }

    fn miss(&self, key: &CacheKey) -> CacheLookup {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "Cache miss");
        CacheLookup::Miss
    }

    fn schedule_touch(&self, key: CacheKey, at: Timestamp) {
        let index = Arc::clone(&self.inner.index);
        self.inner.background.spawn(async move {
            let touched_key = key.clone();
            if let Err(e) = index.call(move |index| index.touch(&touched_key, at)).await {
                tracing::debug!(key = %key, error = %e, "Access time bump failed");
            }
        });
    }

    fn schedule_eviction(&self, source_id: String) {
        let evictor = Arc::clone(&self.inner.evictor);
        self.inner.background.spawn(async move {
            if let Err(e) = evictor.evict_after_write(&source_id).await {
                tracing::error!(source = %source_id, error = %e, "Background eviction failed");
            }
        });
    }

    /// Remove a suspect entry unless it was rewritten after `suspect` was read.
    fn schedule_discard(&self, suspect: CacheEntry) {
        let cache = self.clone();
        self.inner.background.spawn(async move {
            let key = suspect.key.clone();
            let result = cache
                .inner
                .key_locks
                .with_key_lock(key.clone(), || cache.discard_if_unchanged(suspect))
                .await;
            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "Failed to discard suspect entry");
            }
        });
    }

    async fn discard_if_unchanged(&self, suspect: CacheEntry) -> CacheResult<()> {
        let lookup_key = suspect.key.clone();
        let current = self
            .inner
            .index
            .call(move |index| index.get(&lookup_key))
            .await?;
        let unchanged = current.is_some_and(|entry| {
            entry.fetched_at == suspect.fetched_at && entry.size_bytes == suspect.size_bytes
        });
        if unchanged {
            self.remove_entry(suspect.key).await?;
        }
        Ok(())
    }
}

/// Open the index and sweep it, starting over with an empty index if
/// either step finds it corrupt.
async fn open_consistent(
    config: &CacheConfig,
    content: &ContentStore,
) -> CacheResult<(Arc<MetadataIndex>, SweepReport)> {
    let index = match open_index(config).await {
        Ok(index) => Arc::new(index),
        Err(CacheError::Corruption(e)) => {
            tracing::warn!(error = %e, "Metadata index unusable, starting with an empty one");
            reset_index(config).await?;
            Arc::new(open_index(config).await?)
        }
        Err(e) => return Err(e),
    };

    match sweep::reconcile(&index, content).await {
        Ok(report) => Ok((index, report)),
        Err(CacheError::Corruption(e)) => {
            tracing::warn!(error = %e, "Metadata index corrupt, starting with an empty one");
            drop(index);
            reset_index(config).await?;
            let index = Arc::new(open_index(config).await?);
            let report = sweep::reconcile(&index, content).await?;
            Ok((index, report))
        }
        Err(e) => Err(e),
    }
}

async fn open_index(config: &CacheConfig) -> CacheResult<MetadataIndex> {
    let dir = config.index_dir();
    let map_size = config.index_map_size_bytes;
    run_blocking(move || MetadataIndex::open(&dir, map_size)).await
}

async fn reset_index(config: &CacheConfig) -> CacheResult<()> {
    let dir = config.index_dir();
    run_blocking(move || MetadataIndex::reset(&dir)).await
}

async fn run_blocking<T, F>(f: F) -> CacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CacheResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::TaskFailed {
            reason: e.to_string(),
        })?
}

/// Counts writes and background tasks so `settle` and `close` can wait
/// for them.
#[derive(Default)]
struct BackgroundTasks {
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlight(Arc<BackgroundTasks>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    fn track(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(self))
    }

    fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let active = self.track();
        tokio::spawn(async move {
            // The task and everything it captured are gone before the
            // counter drops, so a settled cache holds no stray references.
            task.await;
            drop(active);
        });
    }

    async fn settle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_cache(config: CacheConfig) -> (DocumentCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig {
            data_dir: temp_dir.path().to_path_buf(),
            index_map_size_bytes: 10 * 1024 * 1024,
            ..config
        };
        let cache = DocumentCache::open(config).await.expect("cache should open");
        (cache, temp_dir)
    }

    fn base_config() -> CacheConfig {
        CacheConfig::new("unused")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        let stored = cache
            .put("origin", "main", "a.md", b"# Title", "text/markdown", Some("etag-1".into()))
            .await
            .expect("put should succeed");
        assert_eq!(stored.size_bytes, 7);
        assert!(!stored.is_asset);

        match cache.get("origin", "main", "a.md").await {
            CacheLookup::Hit { bytes, entry } => {
                assert_eq!(bytes, b"# Title");
                assert_eq!(entry.validator.as_deref(), Some("etag-1"));
                assert!(entry.accessed_at > stored.accessed_at);
            }
            CacheLookup::Miss => panic!("expected a hit"),
        }
    }

    #[tokio::test]
    async fn test_get_unknown_and_invalid_keys_miss() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        assert_eq!(cache.get("origin", "main", "absent.md").await, CacheLookup::Miss);
        assert_eq!(cache.get("", "main", "a.md").await, CacheLookup::Miss);

        let stats = cache.global_stats().await.expect("stats");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_input() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        let empty = cache
            .put("origin", "main", "a.md", b"", "text/plain", None)
            .await
            .expect_err("empty content must be rejected");
        assert_eq!(empty.source, CacheError::Validation(ValidationError::EmptyContent));

        let bad_key = cache
            .put("origin", "ma\0in", "a.md", b"x", "text/plain", None)
            .await
            .expect_err("NUL in branch must be rejected");
        assert!(matches!(bad_key.source, CacheError::Validation(_)));
    }

    #[tokio::test]
    async fn test_put_fetched_keeps_fetch_metadata() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        let mut fetched = FetchResult::new("origin", "main", "logo.svg", b"<svg/>".to_vec(), "image/svg+xml")
            .with_validator("w/\"1\"");
        fetched.is_asset = false;

        let entry = cache.put_fetched(&fetched).await.expect("put should succeed");
        assert_eq!(entry.fetched_at, fetched.fetched_at);
        assert!(!entry.is_asset);
        assert_eq!(entry.validator.as_deref(), Some("w/\"1\""));
    }

    #[tokio::test]
    async fn test_missing_blob_is_discarded_as_miss() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        let entry = cache
            .put("origin", "main", "a.md", b"bytes", "text/plain", None)
            .await
            .expect("put should succeed");
        std::fs::remove_file(cache.inner.content.blob_path(&entry.pointer)).expect("remove blob");

        assert_eq!(cache.get("origin", "main", "a.md").await, CacheLookup::Miss);
        cache.settle().await;

        let stats = cache.source_stats("origin").await.expect("stats");
        assert_eq!(stats.entry_count, 0);
        assert!(cache.audit().await.expect("audit").is_consistent());
    }

    #[tokio::test]
    async fn test_stats_views() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        cache
            .put("origin", "main", "a.md", b"12345", "text/plain", None)
            .await
            .expect("put should succeed");
        cache.settle().await;

        match cache.stats(Some("origin")).await.expect("stats") {
            StatsView::Source(stats) => assert_eq!(stats.total_size_bytes, 5),
            other => panic!("unexpected view {other:?}"),
        }
        match cache.stats(None).await.expect("stats") {
            StatsView::Global(stats) => {
                assert_eq!(stats.total_size_bytes, 5);
                assert_eq!(stats.source_count, 1);
            }
            other => panic!("unexpected view {other:?}"),
        }
        let unknown = cache.source_stats("elsewhere").await.expect("stats");
        assert_eq!(unknown, SourceStats::empty("elsewhere"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        cache
            .put("origin", "main", "a.md", b"bytes", "text/plain", None)
            .await
            .expect("put should succeed");

        cache.close().await.expect("close should succeed");
        cache.close().await.expect("second close is a no-op");

        assert_eq!(cache.get("origin", "main", "a.md").await, CacheLookup::Miss);
        let err = cache
            .put("origin", "main", "b.md", b"bytes", "text/plain", None)
            .await
            .expect_err("put after close must fail");
        assert_eq!(err.source, CacheError::Storage(StorageError::Closed));
        assert!(matches!(
            cache.invalidate("origin", None).await,
            Err(CacheError::Storage(StorageError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_close_waits_for_concurrent_lookup() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        cache
            .put("origin", "main", "a.md", b"bytes", "text/plain", None)
            .await
            .expect("put should succeed");
        cache.settle().await;
        let key = CacheKey::new("origin", "main", "a.md").expect("valid key");

        let (lookup, closed) = tokio::join!(cache.lookup(&key), cache.close());
        closed.expect("close should succeed");
        let served = match lookup {
            CacheLookup::Hit { entry, .. } => entry,
            CacheLookup::Miss => panic!("lookup started before close should hit"),
        };

        let config = cache.config().clone();
        drop(cache);
        let reopened = DocumentCache::open(config).await.expect("cache should reopen");
        assert!(!reopened.sweep_report().stats_rebuilt);
        let stored = reopened
            .inner
            .index
            .call(move |index| index.get(&key))
            .await
            .expect("get")
            .expect("entry");
        assert_eq!(stored.accessed_at, served.accessed_at);
        reopened.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_settle_with_nothing_pending_returns() {
        let (cache, _temp_dir) = open_cache(base_config()).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), cache.settle())
            .await
            .expect("settle on an idle cache must return immediately");
    }
}
