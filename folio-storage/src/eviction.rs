//! Two-tier LRU eviction.
//!
//! Both tiers walk the index orderings (least recently used first, larger
//! first among ties) and remove entries until the total is back under the
//! low-water mark. A pass only starts once the total exceeds the cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use folio_core::{ByteSize, CacheConfig, CacheEntry, CacheKey, CacheResult};
use tokio::sync::Mutex;

use crate::clock::MonotonicClock;
use crate::content::ContentStore;
use crate::coordinator::KeyLocks;
use crate::index::MetadataIndex;

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: u64,
    pub freed_bytes: ByteSize,
}

impl EvictionReport {
    pub fn merge(&mut self, other: EvictionReport) {
        self.removed += other.removed;
        self.freed_bytes = self.freed_bytes.saturating_add(other.freed_bytes);
    }
}

/// Where a pass draws its candidates and totals from.
#[derive(Debug, Clone, Copy)]
enum Tier<'a> {
    Source(&'a str),
    Global,
}

/// Removes least recently used entries when a source or the whole cache
/// exceeds its cap.
pub struct Evictor {
    index: Arc<MetadataIndex>,
    content: ContentStore,
    config: Arc<CacheConfig>,
    clock: Arc<MonotonicClock>,
    key_locks: Arc<KeyLocks<CacheKey>>,
    source_passes: KeyLocks<String>,
    global_pass: Mutex<()>,
    evictions: AtomicU64,
}

impl Evictor {
    pub fn new(
        index: Arc<MetadataIndex>,
        content: ContentStore,
        config: Arc<CacheConfig>,
        clock: Arc<MonotonicClock>,
        key_locks: Arc<KeyLocks<CacheKey>>,
    ) -> Self {
        Self {
            index,
            content,
            config,
            clock,
            key_locks,
            source_passes: KeyLocks::new(),
            global_pass: Mutex::new(()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Entries removed by eviction since this evictor was created.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Bring one source back under its cap.
    ///
    /// Passes for the same source are serialized; passes for different
    /// sources run independently.
    pub async fn evict_source(&self, source_id: &str) -> CacheResult<EvictionReport> {
        self.source_passes
            .with_key_lock(source_id.to_string(), || {
                self.run_pass(Tier::Source(source_id))
            })
            .await
    }

    /// Bring the whole cache back under the global cap.
    pub async fn evict_global(&self) -> CacheResult<EvictionReport> {
        let _pass = self.global_pass.lock().await;
        self.run_pass(Tier::Global).await
    }

    /// Per-source pass followed by the global pass, as run after a `put`.
    pub async fn evict_after_write(&self, source_id: &str) -> CacheResult<EvictionReport> {
        let mut report = self.evict_source(source_id).await?;
        report.merge(self.evict_global().await?);
        Ok(report)
    }

    /// Pass for every source over its cap, then the global pass. Run at open.
    pub async fn evict_all(&self) -> CacheResult<EvictionReport> {
        let mut report = EvictionReport::default();
        let sources = self.index.call(|index| index.all_source_stats()).await?;
        for stats in sources {
            if stats.total_size_bytes > self.config.source_cap(&stats.source_id) {
                report.merge(self.evict_source(&stats.source_id).await?);
            }
        }
        report.merge(self.evict_global().await?);
        Ok(report)
    }

    async fn run_pass(&self, tier: Tier<'_>) -> CacheResult<EvictionReport> {
        let cap = match tier {
            Tier::Source(source_id) => self.config.source_cap(source_id),
            Tier::Global => self.config.global_cap_bytes,
        };
        let mut total = self.current_total(tier).await?;
        if total <= cap {
            return Ok(EvictionReport::default());
        }

        let target = self.config.low_water(cap);
        let mut report = EvictionReport::default();

        while total > target {
            let candidates = self.candidates(tier).await?;
            if candidates.is_empty() {
                break;
            }

            let removed_before = report.removed;
            for candidate in candidates {
                if total <= target {
                    break;
                }
                if let Some(freed) = self.evict_candidate(candidate).await? {
                    report.removed += 1;
                    report.freed_bytes = report.freed_bytes.saturating_add(freed);
                    total = total.saturating_sub(freed);
                }
            }

            // Every candidate was touched or rewritten meanwhile; a fresh
            // scan would return the same rows, so stop instead of spinning.
            if report.removed == removed_before {
                break;
            }
            // Concurrent writes may have grown the total since the scan.
            total = self.current_total(tier).await?;
        }

        match tier {
            Tier::Source(source_id) => tracing::info!(
                source = %source_id,
                removed = report.removed,
                freed = report.freed_bytes,
                remaining = total,
                "Source eviction pass finished"
            ),
            Tier::Global => tracing::info!(
                removed = report.removed,
                freed = report.freed_bytes,
                remaining = total,
                "Global eviction pass finished"
            ),
        }
        Ok(report)
    }

    async fn current_total(&self, tier: Tier<'_>) -> CacheResult<ByteSize> {
        match tier {
            Tier::Source(source_id) => {
                let source_id = source_id.to_string();
                let stats = self
                    .index
                    .call(move |index| index.source_stats(&source_id))
                    .await?;
                Ok(stats.map_or(0, |s| s.total_size_bytes))
            }
            Tier::Global => {
                let totals = self.index.call(|index| index.global_totals()).await?;
                Ok(totals.total_size_bytes)
            }
        }
    }

    async fn candidates(&self, tier: Tier<'_>) -> CacheResult<Vec<CacheEntry>> {
        let limit = self.config.eviction_batch;
        match tier {
            Tier::Source(source_id) => {
                let source_id = source_id.to_string();
                self.index
                    .call(move |index| index.oldest_by_source(&source_id, limit))
                    .await
            }
            Tier::Global => self.index.call(move |index| index.oldest_global(limit)).await,
        }
    }

    /// Remove one candidate under its key lock. Returns the bytes freed, or
    /// `None` if the entry changed since it was selected.
    async fn evict_candidate(&self, candidate: CacheEntry) -> CacheResult<Option<ByteSize>> {
        self.key_locks
            .with_key_lock(candidate.key.clone(), || self.remove_if_unchanged(candidate))
            .await
    }

    async fn remove_if_unchanged(&self, candidate: CacheEntry) -> CacheResult<Option<ByteSize>> {
        let key = candidate.key.clone();
        let lookup_key = key.clone();
        let current = self
            .index
            .call(move |index| index.get(&lookup_key))
            .await?;
        let unchanged = current.as_ref().is_some_and(|entry| {
            entry.accessed_at == candidate.accessed_at && entry.size_bytes == candidate.size_bytes
        });
        if !unchanged {
            tracing::debug!(key = %key, "Eviction candidate changed, skipping");
            return Ok(None);
        }

        if let Err(e) = self.content.delete(&candidate.pointer).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete blob during eviction");
            return Ok(None);
        }

        let at = self.clock.now();
        let evict_key = key.clone();
        let removed = self
            .index
            .call(move |index| index.evict(&evict_key, at))
            .await?;

        Ok(removed.map(|entry| {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, bytes = entry.size_bytes, "Evicted entry");
            entry.size_bytes
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        evictor: Evictor,
        index: Arc<MetadataIndex>,
        content: ContentStore,
        clock: Arc<MonotonicClock>,
        _temp_dir: TempDir,
    }

    async fn fixture(config: CacheConfig) -> Fixture {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = Arc::new(CacheConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..config
        });
        let index = Arc::new(
            MetadataIndex::open(&config.index_dir(), 10 * 1024 * 1024).expect("index should open"),
        );
        let content = ContentStore::open(&config.content_dir())
            .await
            .expect("content store should open");
        let clock = Arc::new(MonotonicClock::new());
        let evictor = Evictor::new(
            Arc::clone(&index),
            content.clone(),
            config,
            Arc::clone(&clock),
            Arc::new(KeyLocks::new()),
        );
        Fixture {
            evictor,
            index,
            content,
            clock,
            _temp_dir: temp_dir,
        }
    }

    impl Fixture {
        async fn insert(&self, source: &str, path: &str, size: u64) -> CacheEntry {
            let key = CacheKey::new(source, "main", path).expect("valid key");
            let at = self.clock.now();
            let entry = CacheEntry {
                pointer: key.content_pointer(),
                key,
                size_bytes: size,
                fetched_at: at,
                accessed_at: at,
                content_type: "text/plain".to_string(),
                is_asset: false,
                validator: None,
            };
            self.content
                .write(&entry.pointer, &vec![b'x'; size as usize])
                .await
                .expect("blob write");
            self.index.upsert(&entry).expect("upsert");
            entry
        }

        fn total(&self, source: &str) -> u64 {
            self.index
                .source_stats(source)
                .expect("stats")
                .map_or(0, |s| s.total_size_bytes)
        }
    }

    #[tokio::test]
    async fn test_under_cap_is_noop() {
        let f = fixture(CacheConfig::new("unused").with_default_source_cap(100)).await;
        f.insert("s", "a", 50).await;
        let report = f.evictor.evict_source("s").await.expect("pass");
        assert_eq!(report, EvictionReport::default());
    }

    #[tokio::test]
    async fn test_source_pass_runs_to_low_water() {
        let f = fixture(
            CacheConfig::new("unused")
                .with_default_source_cap(100)
                .with_global_cap(10_000),
        )
        .await;
        for i in 0..11 {
            f.insert("s", &format!("doc-{i:02}"), 10).await;
        }

        let report = f.evictor.evict_source("s").await.expect("pass");
        assert_eq!(report.removed, 2);
        assert_eq!(report.freed_bytes, 20);
        assert_eq!(f.total("s"), 90);
        assert_eq!(f.evictor.evictions(), 2);

        let first = CacheKey::new("s", "main", "doc-00").expect("valid key");
        assert!(f.index.get(&first).expect("get").is_none());
        assert!(!f
            .content
            .exists(&first.content_pointer())
            .await
            .expect("exists"));
        let stats = f.index.source_stats("s").expect("stats").expect("row");
        assert!(stats.last_eviction_at.is_some());
    }

    #[tokio::test]
    async fn test_touched_entry_survives() {
        let f = fixture(
            CacheConfig::new("unused")
                .with_default_source_cap(20)
                .with_global_cap(10_000)
                .with_low_water_ratio(1.0),
        )
        .await;
        let a = f.insert("s", "a", 10).await;
        let b = f.insert("s", "b", 10).await;
        f.index.touch(&a.key, f.clock.now()).expect("touch");
        f.insert("s", "c", 10).await;

        let report = f.evictor.evict_source("s").await.expect("pass");
        assert_eq!(report.removed, 1);
        assert!(f.index.get(&a.key).expect("get").is_some());
        assert!(f.index.get(&b.key).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_ties_evict_larger_first() {
        let f = fixture(
            CacheConfig::new("unused")
                .with_default_source_cap(30)
                .with_global_cap(10_000)
                .with_low_water_ratio(1.0),
        )
        .await;
        let small = f.insert("s", "small", 5).await;
        let mut large = f.insert("s", "large", 20).await;
        // Force an exact tie on access time.
        f.index.remove(&large.key).expect("remove");
        large.accessed_at = small.accessed_at;
        f.index.upsert(&large).expect("upsert");
        f.insert("s", "newest", 10).await;

        let report = f.evictor.evict_source("s").await.expect("pass");
        assert_eq!(report.removed, 1);
        assert!(f.index.get(&large.key).expect("get").is_none());
        assert!(f.index.get(&small.key).expect("get").is_some());
    }

    #[tokio::test]
    async fn test_global_pass_crosses_sources() {
        let f = fixture(
            CacheConfig::new("unused")
                .with_default_source_cap(1_000)
                .with_global_cap(100),
        )
        .await;
        let oldest = f.insert("a", "old", 40).await;
        f.insert("b", "mid", 40).await;
        f.insert("a", "new", 40).await;

        let report = f.evictor.evict_global().await.expect("pass");
        assert_eq!(report.removed, 1);
        assert!(f.index.get(&oldest.key).expect("get").is_none());
        assert_eq!(f.index.global_totals().expect("totals").total_size_bytes, 80);
    }

    #[tokio::test]
    async fn test_evict_all_handles_every_source() {
        let f = fixture(
            CacheConfig::new("unused")
                .with_default_source_cap(20)
                .with_global_cap(10_000),
        )
        .await;
        for i in 0..3 {
            f.insert("a", &format!("a{i}"), 10).await;
            f.insert("b", &format!("b{i}"), 10).await;
        }

        let report = f.evictor.evict_all().await.expect("pass");
        assert_eq!(report.removed, 4);
        assert!(f.total("a") <= 18);
        assert!(f.total("b") <= 18);
    }

    #[tokio::test]
    async fn test_changed_candidate_is_skipped() {
        let f = fixture(CacheConfig::new("unused")).await;
        let entry = f.insert("s", "a", 10).await;
        let mut stale = entry.clone();
        stale.accessed_at = entry.accessed_at - Duration::seconds(5);

        assert_eq!(f.evictor.evict_candidate(stale).await.expect("evict"), None);
        assert!(f.index.get(&entry.key).expect("get").is_some());
        assert_eq!(
            f.evictor.evict_candidate(entry).await.expect("evict"),
            Some(10)
        );
    }
}
