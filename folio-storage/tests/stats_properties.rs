//! Property tests over random operation sequences.
//!
//! With generous caps the cache must behave like a plain map; with tight
//! caps it must stay internally consistent and within bounds.

use std::collections::HashMap;

use folio_core::{CacheKey, CacheLookup};
use folio_test_utils::assertions::assert_index_consistent;
use folio_test_utils::fixtures::TestCache;
use folio_test_utils::generators::{arb_cache_op, CacheOp};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build")
}

fn invalidated(key: &CacheKey, source_id: &str, branch: Option<&str>) -> bool {
    key.source_id() == source_id && branch.map_or(true, |b| key.branch() == b)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Without eviction pressure, gets return exactly what the model holds
    /// and stats equal the model's sums.
    #[test]
    fn prop_uncapped_cache_matches_model(ops in prop::collection::vec(arb_cache_op(), 1..40)) {
        runtime().block_on(async {
            let cache = TestCache::open().await;
            let mut model: HashMap<CacheKey, Vec<u8>> = HashMap::new();

            for op in ops {
                match op {
                    CacheOp::Put { key, bytes } => {
                        cache
                            .put(key.source_id(), key.branch(), key.path(), &bytes, "text/plain", None)
                            .await
                            .expect("put should succeed");
                        model.insert(key, bytes);
                    }
                    CacheOp::Get { key } => {
                        let lookup = cache.lookup(&key).await;
                        match (lookup, model.get(&key)) {
                            (CacheLookup::Hit { bytes, .. }, Some(expected)) => assert_eq!(&bytes, expected),
                            (CacheLookup::Miss, None) => {}
                            (lookup, expected) => panic!("cache {lookup:?} vs model {expected:?}"),
                        }
                    }
                    CacheOp::Invalidate { source_id, branch } => {
                        cache
                            .invalidate(&source_id, branch.as_deref())
                            .await
                            .expect("invalidate should succeed");
                        model.retain(|key, _| !invalidated(key, &source_id, branch.as_deref()));
                    }
                }
            }

            let report = assert_index_consistent(cache.cache()).await;
            assert_eq!(report.entries, model.len() as u64);
            assert_eq!(report.total_size_bytes, model.values().map(|b| b.len() as u64).sum::<u64>());

            for source in ["origin", "mirror", "wiki"] {
                let expected: u64 = model
                    .iter()
                    .filter(|(key, _)| key.source_id() == source)
                    .map(|(_, bytes)| bytes.len() as u64)
                    .sum();
                let stats = cache.source_stats(source).await.expect("stats");
                assert_eq!(stats.total_size_bytes, expected, "source {source}");
            }
        });
    }

    /// Under tight caps every settled state is consistent and bounded.
    #[test]
    fn prop_capped_cache_stays_consistent(ops in prop::collection::vec(arb_cache_op(), 1..40)) {
        runtime().block_on(async {
            let cache = TestCache::open_with(|c| c.with_default_source_cap(96).with_global_cap(160)).await;

            for op in ops {
                match op {
                    CacheOp::Put { key, bytes } => {
                        cache
                            .put(key.source_id(), key.branch(), key.path(), &bytes, "text/plain", None)
                            .await
                            .expect("put should succeed");
                        cache.settle().await;
                    }
                    CacheOp::Get { key } => {
                        if let CacheLookup::Hit { bytes, entry } = cache.lookup(&key).await {
                            assert_eq!(bytes.len() as u64, entry.size_bytes);
                        }
                    }
                    CacheOp::Invalidate { source_id, branch } => {
                        let report = cache
                            .invalidate(&source_id, branch.as_deref())
                            .await
                            .expect("invalidate should succeed");
                        assert_eq!(report.deferred, 0);
                    }
                }
            }

            assert_index_consistent(cache.cache()).await;
            let global = cache.global_stats().await.expect("stats");
            assert!(global.total_size_bytes <= 160);
            for source in ["origin", "mirror", "wiki"] {
                let stats = cache.source_stats(source).await.expect("stats");
                assert!(stats.total_size_bytes <= 96, "source {source} at {}", stats.total_size_bytes);
            }
        });
    }
}
