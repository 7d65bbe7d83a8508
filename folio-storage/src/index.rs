//! LMDB-backed metadata index.
//!
//! Uses the heed crate (Rust bindings for LMDB) to hold entry metadata,
//! both LRU orderings and per-source aggregate stats in one environment, so
//! a single write transaction can keep all of them in step.
//!
//! # Databases
//!
//! - `entries`: encoded key → [`CacheEntry`]
//! - `lru_by_source`: `source 0x00 | stamp | encoded key` → unit
//! - `lru_global`: `stamp | encoded key` → unit
//! - `sources`: source id → [`SourceStats`]
//! - `meta`: schema version and the clean-shutdown flag
//!
//! A stamp is 16 bytes: `accessed_at` in order-preserving big-endian
//! microseconds, then `u64::MAX - size_bytes`. Lexicographic key order is
//! therefore "least recently used first, larger first among ties", which is
//! exactly the eviction order.
//!
//! # Thread Safety
//!
//! All methods are synchronous and may block on LMDB's single writer lock.
//! Async callers go through [`MetadataIndex::call`], which runs the closure
//! on tokio's blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use folio_core::{
    CacheEntry, CacheError, CacheKey, CacheResult, CorruptionError, GlobalStats, IoError,
    SourceStats, StorageError, Timestamp,
};
use heed::types::{Bytes, SerdeBincode, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

/// Bumped whenever the on-disk record layout changes.
const SCHEMA_VERSION: u32 = 1;
const SCHEMA_KEY: &str = "schema_version";
const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";
const STAMP_LEN: usize = 16;

type EntryDb = Database<Bytes, SerdeBincode<CacheEntry>>;
type OrderDb = Database<Bytes, Unit>;
type SourceDb = Database<Str, SerdeBincode<SourceStats>>;
type MetaDb = Database<Str, SerdeBincode<u32>>;

/// Durable, transactional record store for cache metadata.
pub struct MetadataIndex {
    env: Env,
    path: PathBuf,
    entries: EntryDb,
    lru_by_source: OrderDb,
    lru_global: OrderDb,
    sources: SourceDb,
    meta: MetaDb,
}

impl MetadataIndex {
    /// Open or create the index at `path`.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the directory cannot be created
    /// - `CacheError::Corruption` if the environment or its schema cannot be trusted
    pub fn open(path: &Path, map_size: usize) -> CacheResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| IoError::new("create index dir", path, &e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(5)
                .open(path)
        }
        .map_err(|e| classify("open index", path, e))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| classify("open index", path, e))?;

        let create = |wtxn: &mut RwTxn<'_>| -> heed::Result<_> {
            let entries: EntryDb = env.create_database(wtxn, Some("entries"))?;
            let lru_by_source: OrderDb = env.create_database(wtxn, Some("lru_by_source"))?;
            let lru_global: OrderDb = env.create_database(wtxn, Some("lru_global"))?;
            let sources: SourceDb = env.create_database(wtxn, Some("sources"))?;
            let meta: MetaDb = env.create_database(wtxn, Some("meta"))?;
            Ok((entries, lru_by_source, lru_global, sources, meta))
        };
        let (entries, lru_by_source, lru_global, sources, meta) =
            create(&mut wtxn).map_err(|e| classify("open index", path, e))?;

        let version = meta
            .get(&wtxn, SCHEMA_KEY)
            .map_err(|e| classify("open index", path, e))?;
        match version {
            Some(found) if found != SCHEMA_VERSION => {
                return Err(CorruptionError::SchemaMismatch {
                    found,
                    expected: SCHEMA_VERSION,
                }
                .into());
            }
            Some(_) => {}
            None => {
                meta.put(&mut wtxn, SCHEMA_KEY, &SCHEMA_VERSION)
                    .map_err(|e| classify("open index", path, e))?;
            }
        }

        wtxn.commit()
            .map_err(|e| classify("open index", path, e))?;

        Ok(Self {
            env,
            path: path.to_path_buf(),
            entries,
            lru_by_source,
            lru_global,
            sources,
            meta,
        })
    }

    /// Delete the index directory so the next `open` starts empty.
    pub fn reset(path: &Path) -> CacheResult<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IoError::new("reset index", path, &e).into()),
        }
    }

    /// Run `f` against this index on the blocking pool.
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&MetadataIndex) -> CacheResult<T> + Send + 'static,
    {
        let index = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || f(&index))
            .await
            .map_err(|e| StorageError::TaskFailed {
                reason: e.to_string(),
            })?;
        result
    }

    // ========================================================================
    // ENTRY OPERATIONS
    // ========================================================================

    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let encoded = key.encode();
        self.read("get", |rtxn| self.entries.get(rtxn, encoded.as_slice()))
    }

    /// Insert or replace an entry, returning the row it replaced.
    ///
    /// The entry row, both LRU orderings and the owning source's stats are
    /// updated in one transaction.
    pub fn upsert(&self, entry: &CacheEntry) -> CacheResult<Option<CacheEntry>> {
        let encoded = entry.key.encode();
        let source_id = entry.source_id();

        self.write("upsert", |wtxn| {
            let previous = self.entries.get(wtxn, encoded.as_slice())?;
            let mut stats = self
                .sources
                .get(wtxn, source_id)?
                .unwrap_or_else(|| SourceStats::empty(source_id));

            if let Some(prev) = &previous {
                self.unlink_order(wtxn, prev, &encoded)?;
                stats.subtract(prev.size_bytes);
            }

            self.entries.put(wtxn, encoded.as_slice(), entry)?;
            self.link_order(wtxn, entry, &encoded)?;
            stats.add(entry.size_bytes);
            self.sources.put(wtxn, source_id, &stats)?;
            Ok(previous)
        })
    }

    /// Remove an entry, returning the removed row.
    pub fn remove(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.write("remove", |wtxn| self.remove_in_txn(wtxn, key, None))
    }

    /// Remove an entry as part of an eviction pass, stamping the source's
    /// `last_eviction_at` in the same transaction.
    pub fn evict(&self, key: &CacheKey, at: Timestamp) -> CacheResult<Option<CacheEntry>> {
        self.write("evict", |wtxn| self.remove_in_txn(wtxn, key, Some(at)))
    }

    /// Move `accessed_at` forward to `at`.
    ///
    /// Last write wins, but only forwards: a stale bump arriving late is a
    /// no-op. Returns whether the entry was updated.
    pub fn touch(&self, key: &CacheKey, at: Timestamp) -> CacheResult<bool> {
        let encoded = key.encode();

        self.write("touch", |wtxn| {
            let Some(mut entry) = self.entries.get(wtxn, encoded.as_slice())? else {
                return Ok(false);
            };
            if at <= entry.accessed_at {
                return Ok(false);
            }

            self.unlink_order(wtxn, &entry, &encoded)?;
            entry.accessed_at = at;
            self.entries.put(wtxn, encoded.as_slice(), &entry)?;
            self.link_order(wtxn, &entry, &encoded)?;
            Ok(true)
        })
    }

    /// Up to `limit` entries of one source, least recently used first.
    pub fn oldest_by_source(&self, source_id: &str, limit: usize) -> CacheResult<Vec<CacheEntry>> {
        let prefix = CacheKey::source_prefix(source_id);

        self.read("oldest_by_source", |rtxn| {
            let mut oldest = Vec::with_capacity(limit);
            for item in self
                .lru_by_source
                .prefix_iter(rtxn, prefix.as_slice())?
                .take(limit)
            {
                let (order_key, _) = item?;
                let encoded = &order_key[prefix.len() + STAMP_LEN..];
                if let Some(entry) = self.entries.get(rtxn, encoded)? {
                    oldest.push(entry);
                }
            }
            Ok(oldest)
        })
    }

    /// Up to `limit` entries across all sources, least recently used first.
    pub fn oldest_global(&self, limit: usize) -> CacheResult<Vec<CacheEntry>> {
        self.read("oldest_global", |rtxn| {
            let mut oldest = Vec::with_capacity(limit);
            for item in self.lru_global.iter(rtxn)?.take(limit) {
                let (order_key, _) = item?;
                if let Some(entry) = self.entries.get(rtxn, &order_key[STAMP_LEN..])? {
                    oldest.push(entry);
                }
            }
            Ok(oldest)
        })
    }

    /// All entries whose encoded key starts with `prefix`.
    pub fn entries_with_prefix(&self, prefix: &[u8]) -> CacheResult<Vec<CacheEntry>> {
        self.read("entries_with_prefix", |rtxn| {
            let mut matching = Vec::new();
            for item in self.entries.prefix_iter(rtxn, prefix)? {
                let (_, entry) = item?;
                matching.push(entry);
            }
            Ok(matching)
        })
    }

    pub fn all_entries(&self) -> CacheResult<Vec<CacheEntry>> {
        self.read("all_entries", |rtxn| {
            let mut all = Vec::new();
            for item in self.entries.iter(rtxn)? {
                let (_, entry) = item?;
                all.push(entry);
            }
            Ok(all)
        })
    }

    /// Newest `accessed_at` on record, used to seed the clock after restart.
    pub fn newest_access(&self) -> CacheResult<Option<Timestamp>> {
        self.read("newest_access", |rtxn| {
            Ok(self
                .lru_global
                .last(rtxn)?
                .and_then(|(order_key, _)| decode_stamp_time(order_key)))
        })
    }

    // ========================================================================
    // STATS OPERATIONS
    // ========================================================================

    pub fn source_stats(&self, source_id: &str) -> CacheResult<Option<SourceStats>> {
        self.read("source_stats", |rtxn| self.sources.get(rtxn, source_id))
    }

    pub fn all_source_stats(&self) -> CacheResult<Vec<SourceStats>> {
        self.read("all_source_stats", |rtxn| {
            let mut all = Vec::new();
            for item in self.sources.iter(rtxn)? {
                let (_, stats) = item?;
                all.push(stats);
            }
            Ok(all)
        })
    }

    /// Totals across all sources. Hit/miss/eviction counters are left at zero;
    /// they live in memory with the facade.
    pub fn global_totals(&self) -> CacheResult<GlobalStats> {
        let mut totals = GlobalStats::default();
        for stats in self.all_source_stats()? {
            totals.total_size_bytes = totals.total_size_bytes.saturating_add(stats.total_size_bytes);
            totals.entry_count = totals.entry_count.saturating_add(stats.entry_count);
            if stats.entry_count > 0 {
                totals.source_count += 1;
            }
        }
        Ok(totals)
    }

    /// Drop the stats row of a source that no longer has entries.
    pub fn drop_source_if_empty(&self, source_id: &str) -> CacheResult<bool> {
        let prefix = CacheKey::source_prefix(source_id);

        self.write("drop_source", |wtxn| {
            let has_entries = self
                .entries
                .prefix_iter(wtxn, prefix.as_slice())?
                .next()
                .is_some();
            if has_entries {
                return Ok(false);
            }
            self.sources.delete(wtxn, source_id)
        })
    }

    /// Recompute every source's stats from the entry rows.
    ///
    /// Only needed after abnormal termination; in steady state every
    /// mutation keeps the stats exact. `last_eviction_at` is preserved.
    pub fn rebuild_stats(&self) -> CacheResult<usize> {
        self.write("rebuild_stats", |wtxn| {
            let mut rebuilt: BTreeMap<String, SourceStats> = BTreeMap::new();

            for item in self.sources.iter(wtxn)? {
                let (source_id, stats) = item?;
                let mut fresh = SourceStats::empty(source_id);
                fresh.last_eviction_at = stats.last_eviction_at;
                rebuilt.insert(source_id.to_string(), fresh);
            }

            for item in self.entries.iter(wtxn)? {
                let (_, entry) = item?;
                rebuilt
                    .entry(entry.source_id().to_string())
                    .or_insert_with(|| SourceStats::empty(entry.source_id()))
                    .add(entry.size_bytes);
            }

            self.sources.clear(wtxn)?;
            for (source_id, stats) in &rebuilt {
                self.sources.put(wtxn, source_id.as_str(), stats)?;
            }
            Ok(rebuilt.len())
        })
    }

    // ========================================================================
    // LIFECYCLE FLAGS
    // ========================================================================

    /// Whether the previous run closed the index cleanly. A fresh index
    /// counts as clean.
    pub fn was_clean(&self) -> CacheResult<bool> {
        let flag = self.read("was_clean", |rtxn| self.meta.get(rtxn, CLEAN_SHUTDOWN_KEY))?;
        Ok(flag.map_or(true, |f| f == 1))
    }

    /// Record that the index is in use; a crash leaves this flag behind.
    pub fn mark_dirty(&self) -> CacheResult<()> {
        self.write("mark_dirty", |wtxn| {
            self.meta.put(wtxn, CLEAN_SHUTDOWN_KEY, &0)
        })
    }

    /// Record a clean shutdown and flush the environment to disk.
    pub fn mark_clean(&self) -> CacheResult<()> {
        self.write("mark_clean", |wtxn| {
            self.meta.put(wtxn, CLEAN_SHUTDOWN_KEY, &1)
        })?;
        self.sync()
    }

    pub fn sync(&self) -> CacheResult<()> {
        self.env
            .force_sync()
            .map_err(|e| classify("sync index", &self.path, e))
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn read<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&RoTxn<'_>) -> heed::Result<T>,
    ) -> CacheResult<T> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| classify(operation, &self.path, e))?;
        f(&rtxn).map_err(|e| classify(operation, &self.path, e))
    }

    fn write<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut RwTxn<'_>) -> heed::Result<T>,
    ) -> CacheResult<T> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| classify(operation, &self.path, e))?;
        let value = f(&mut wtxn).map_err(|e| classify(operation, &self.path, e))?;
        wtxn.commit()
            .map_err(|e| classify(operation, &self.path, e))?;
        Ok(value)
    }

    fn remove_in_txn(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: &CacheKey,
        evicted_at: Option<Timestamp>,
    ) -> heed::Result<Option<CacheEntry>> {
        let encoded = key.encode();
        let Some(previous) = self.entries.get(wtxn, encoded.as_slice())? else {
            return Ok(None);
        };

        self.entries.delete(wtxn, encoded.as_slice())?;
        self.unlink_order(wtxn, &previous, &encoded)?;

        let source_id = key.source_id();
        let mut stats = self
            .sources
            .get(wtxn, source_id)?
            .unwrap_or_else(|| SourceStats::empty(source_id));
        stats.subtract(previous.size_bytes);
        if let Some(at) = evicted_at {
            stats.last_eviction_at = Some(at);
        }
        self.sources.put(wtxn, source_id, &stats)?;

        Ok(Some(previous))
    }

    fn link_order(&self, wtxn: &mut RwTxn<'_>, entry: &CacheEntry, encoded: &[u8]) -> heed::Result<()> {
        let stamp = order_stamp(entry);
        self.lru_by_source.put(
            wtxn,
            source_order_key(entry.source_id(), &stamp, encoded).as_slice(),
            &(),
        )?;
        self.lru_global
            .put(wtxn, global_order_key(&stamp, encoded).as_slice(), &())
    }

    fn unlink_order(&self, wtxn: &mut RwTxn<'_>, entry: &CacheEntry, encoded: &[u8]) -> heed::Result<()> {
        let stamp = order_stamp(entry);
        self.lru_by_source.delete(
            wtxn,
            source_order_key(entry.source_id(), &stamp, encoded).as_slice(),
        )?;
        self.lru_global
            .delete(wtxn, global_order_key(&stamp, encoded).as_slice())?;
        Ok(())
    }
}

/// Sort stamp: access time ascending, then size descending.
fn order_stamp(entry: &CacheEntry) -> [u8; STAMP_LEN] {
    let micros = (entry.accessed_at.timestamp_micros() as u64) ^ (1u64 << 63);
    let inverted_size = u64::MAX - entry.size_bytes;

    let mut stamp = [0u8; STAMP_LEN];
    stamp[0..8].copy_from_slice(&micros.to_be_bytes());
    stamp[8..16].copy_from_slice(&inverted_size.to_be_bytes());
    stamp
}

fn decode_stamp_time(order_key: &[u8]) -> Option<Timestamp> {
    let micros: [u8; 8] = order_key.get(0..8)?.try_into().ok()?;
    let micros = (u64::from_be_bytes(micros) ^ (1u64 << 63)) as i64;
    DateTime::from_timestamp_micros(micros)
}

fn source_order_key(source_id: &str, stamp: &[u8; STAMP_LEN], encoded: &[u8]) -> Vec<u8> {
    let mut key = CacheKey::source_prefix(source_id);
    key.reserve(STAMP_LEN + encoded.len());
    key.extend_from_slice(stamp);
    key.extend_from_slice(encoded);
    key
}

fn global_order_key(stamp: &[u8; STAMP_LEN], encoded: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(STAMP_LEN + encoded.len());
    key.extend_from_slice(stamp);
    key.extend_from_slice(encoded);
    key
}

/// Map a heed error onto the cache taxonomy.
fn classify(operation: &'static str, path: &Path, err: heed::Error) -> CacheError {
    match err {
        heed::Error::Io(e) => IoError::new(operation, path, &e).into(),
        heed::Error::Decoding(e) => CorruptionError::UndecodableRecord {
            reason: format!("{operation}: {e}"),
        }
        .into(),
        heed::Error::Mdb(
            e @ (heed::MdbError::Corrupted
            | heed::MdbError::Invalid
            | heed::MdbError::PageNotFound
            | heed::MdbError::VersionMismatch),
        ) => CorruptionError::IndexUnreadable {
            reason: format!("{operation}: {e}"),
        }
        .into(),
        other => StorageError::TransactionFailed {
            reason: format!("{operation}: {other}"),
        }
        .into(),
    }
}
