//! Folio Test Utilities
//!
//! Shared test infrastructure for the Folio workspace:
//! - Proptest generators for keys, content and cache operations
//! - A temp-dir backed cache fixture with restart and crash helpers
//! - Assertions for the cache's consistency invariants

pub use folio_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheLookup, CacheResult, FetchResult,
    SourceStats, StatsView,
};
pub use folio_storage::{AuditReport, DocumentCache};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use super::*;
    use proptest::prelude::*;

    /// Source ids drawn from a small pool so that generated operations
    /// actually collide on sources.
    pub fn arb_source_id() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["origin", "mirror", "wiki"]).prop_map(str::to_string)
    }

    /// Branch names from a small pool.
    pub fn arb_branch() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["main", "dev"]).prop_map(str::to_string)
    }

    /// Document paths from a small pool.
    pub fn arb_path() -> impl Strategy<Value = String> {
        (0u8..6).prop_map(|n| format!("docs/page-{n}.md"))
    }

    /// Any valid key component, for encoding tests.
    pub fn arb_component() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_./@:-]{1,32}"
    }

    /// A validated cache key over the small pools.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_source_id(), arb_branch(), arb_path()).prop_map(|(source, branch, path)| {
            CacheKey::new(source, branch, path).unwrap_or_else(|e| panic!("generated key invalid: {e}"))
        })
    }

    /// Non-empty document bytes.
    pub fn arb_content() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..64)
    }

    /// A MIME type, documents and assets alike.
    pub fn arb_content_type() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["text/markdown", "application/json", "image/png", "font/woff2"])
            .prop_map(str::to_string)
    }

    /// A fetch result for a generated key.
    pub fn arb_fetch_result() -> impl Strategy<Value = FetchResult> {
        (arb_cache_key(), arb_content(), arb_content_type()).prop_map(|(key, bytes, content_type)| {
            FetchResult::new(key.source_id(), key.branch(), key.path(), bytes, content_type)
        })
    }

    /// One step of a random workload against the cache.
    #[derive(Debug, Clone)]
    pub enum CacheOp {
        Put { key: CacheKey, bytes: Vec<u8> },
        Get { key: CacheKey },
        Invalidate { source_id: String, branch: Option<String> },
    }

    pub fn arb_cache_op() -> impl Strategy<Value = CacheOp> {
        prop_oneof![
            6 => (arb_cache_key(), arb_content()).prop_map(|(key, bytes)| CacheOp::Put { key, bytes }),
            3 => arb_cache_key().prop_map(|key| CacheOp::Get { key }),
            1 => (arb_source_id(), prop::option::of(arb_branch()))
                .prop_map(|(source_id, branch)| CacheOp::Invalidate { source_id, branch }),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A cache rooted in a temp dir that can be restarted or "crashed".

    use super::*;
    use std::ops::Deref;
    use std::path::Path;
    use tempfile::TempDir;

    /// Small LMDB map so tests don't reserve hundreds of MiB each.
    pub const TEST_MAP_SIZE: usize = 10 * 1024 * 1024;

    /// Config for a test cache rooted at `data_dir`.
    pub fn test_config(data_dir: &Path) -> CacheConfig {
        CacheConfig::new(data_dir).with_index_map_size(TEST_MAP_SIZE)
    }

    /// An open cache that owns its data directory.
    pub struct TestCache {
        cache: DocumentCache,
        config: CacheConfig,
        dir: TempDir,
    }

    impl TestCache {
        /// Open with default caps.
        pub async fn open() -> Self {
            Self::open_with(|config| config).await
        }

        /// Open with a config adjusted by `customize`.
        pub async fn open_with(customize: impl FnOnce(CacheConfig) -> CacheConfig) -> Self {
            let dir = TempDir::new().expect("TempDir creation should succeed");
            let config = customize(test_config(dir.path()));
            let cache = DocumentCache::open(config.clone())
                .await
                .expect("test cache should open");
            Self { cache, config, dir }
        }

        pub fn cache(&self) -> &DocumentCache {
            &self.cache
        }

        pub fn config(&self) -> &CacheConfig {
            &self.config
        }

        pub fn data_dir(&self) -> &Path {
            self.dir.path()
        }

        /// Close cleanly and open again on the same directory.
        pub async fn restart(self) -> Self {
            let Self { cache, config, dir } = self;
            cache.close().await.expect("close should succeed");
            drop(cache);
            Self::reopen(config, dir).await
        }

        /// Drop the cache without closing it, as a killed process would,
        /// and open again on the same directory.
        pub async fn crash_and_restart(self) -> Self {
            let Self { cache, config, dir } = self;
            cache.settle().await;
            drop(cache);
            Self::reopen(config, dir).await
        }

        /// Let the caller tamper with the files while the cache is down.
        pub async fn crash_tamper_restart(self, tamper: impl FnOnce(&Path)) -> Self {
            let Self { cache, config, dir } = self;
            cache.settle().await;
            drop(cache);
            tamper(dir.path());
            Self::reopen(config, dir).await
        }

        async fn reopen(config: CacheConfig, dir: TempDir) -> Self {
            let cache = DocumentCache::open(config.clone())
                .await
                .expect("test cache should reopen");
            Self { cache, config, dir }
        }
    }

    impl Deref for TestCache {
        type Target = DocumentCache;

        fn deref(&self) -> &DocumentCache {
            &self.cache
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache invariants.

    use super::*;

    /// Assert that an audit found no inconsistency.
    #[track_caller]
    pub fn assert_audit_clean(report: &AuditReport) {
        assert!(
            report.is_consistent(),
            "Cache is inconsistent: {:#?}",
            report
        );
    }

    /// Settle the cache, audit it and assert every invariant holds:
    /// stats equal the sum of entries, every entry has a blob of matching
    /// length, every blob has an entry.
    pub async fn assert_index_consistent(cache: &DocumentCache) -> AuditReport {
        cache.settle().await;
        let report = cache.audit().await.expect("audit should succeed");
        assert_audit_clean(&report);
        report
    }

    /// Assert that a lookup hit with exactly `expected` bytes.
    #[track_caller]
    pub fn assert_hit(lookup: &CacheLookup, expected: &[u8]) {
        match lookup {
            CacheLookup::Hit { bytes, .. } => assert_eq!(bytes.as_slice(), expected, "Hit with wrong bytes"),
            CacheLookup::Miss => panic!("Expected Hit, got Miss"),
        }
    }

    /// Assert that a lookup missed.
    #[track_caller]
    pub fn assert_miss(lookup: &CacheLookup) {
        assert!(!lookup.is_hit(), "Expected Miss, got: {:?}", lookup);
    }

    /// Assert that a result failed with a validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}
