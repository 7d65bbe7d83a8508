//! Startup consistency sweep.
//!
//! Reconciles the index against the content tree. Anything suspect is
//! deleted rather than repaired, since every entry can be fetched again.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use folio_core::{ByteSize, CacheKey, CacheResult, ContentPointer, SourceStats};

use crate::content::ContentStore;
use crate::index::MetadataIndex;

/// What the sweep found and removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Index rows dropped because their blob was missing or the wrong size.
    pub orphan_rows: u64,
    /// Blobs (and unrecognized files) deleted because no row referenced them.
    pub orphan_blobs: u64,
    /// Leftover temp files from interrupted writes.
    pub temp_files: u64,
    /// Files the sweep could not inspect or delete. They are left for the
    /// next sweep.
    pub deferred: u64,
    /// Whether source stats were recomputed after an unclean shutdown.
    pub stats_rebuilt: bool,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_rows == 0 && self.orphan_blobs == 0 && self.temp_files == 0 && self.deferred == 0
    }
}

/// Run the sweep. Must be called before the index is marked dirty for the
/// new session, so the previous session's shutdown state is still visible.
///
/// Only failures to list the content tree or to use the index are returned.
/// A single file that cannot be read or deleted is logged and counted in
/// [`SweepReport::deferred`].
pub async fn reconcile(
    index: &Arc<MetadataIndex>,
    content: &ContentStore,
) -> CacheResult<SweepReport> {
    let mut report = SweepReport::default();
    let was_clean = index.call(|index| index.was_clean()).await?;

    report.temp_files = content.purge_temp().await?;

    let entries = index.call(|index| index.all_entries()).await?;
    let mut referenced: HashSet<ContentPointer> = HashSet::with_capacity(entries.len());
    for entry in entries {
        let on_disk = if entry.pointer == entry.key.content_pointer() {
            match content.len(&entry.pointer).await {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Blob unreadable during sweep");
                    None
                }
            }
        } else {
            None
        };
        if on_disk == Some(entry.size_bytes) {
            referenced.insert(entry.pointer);
            continue;
        }

        tracing::warn!(
            key = %entry.key,
            expected = entry.size_bytes,
            found = ?on_disk,
            "Dropping index row without a matching blob"
        );
        let key = entry.key.clone();
        index.call(move |index| index.remove(&key)).await?;
        report.orphan_rows += 1;
    }

    let (pointers, strays) = content.list_pointers().await?;
    for pointer in pointers {
        if referenced.contains(&pointer) {
            continue;
        }
        tracing::debug!(pointer = %pointer, "Deleting orphan blob");
        let deleted = match content.delete(&pointer).await {
            Ok(_) => Ok(()),
            // Something other than a regular file sits at the pointer path.
            Err(_) => content.remove_stray(&content.blob_path(&pointer)).await,
        };
        match deleted {
            Ok(()) => report.orphan_blobs += 1,
            Err(e) => {
                tracing::warn!(pointer = %pointer, error = %e, "Orphan blob left for the next sweep");
                report.deferred += 1;
            }
        }
    }
    for stray in strays {
        tracing::debug!(path = %stray.display(), "Deleting unrecognized file in content tree");
        match content.remove_stray(&stray).await {
            Ok(()) => report.orphan_blobs += 1,
            Err(e) => {
                tracing::warn!(path = %stray.display(), error = %e, "Stray file left for the next sweep");
                report.deferred += 1;
            }
        }
    }

    if !was_clean {
        let sources = index.call(|index| index.rebuild_stats()).await?;
        tracing::info!(sources, "Rebuilt source stats after unclean shutdown");
        report.stats_rebuilt = true;
    }

    tracing::info!(
        orphan_rows = report.orphan_rows,
        orphan_blobs = report.orphan_blobs,
        temp_files = report.temp_files,
        deferred = report.deferred,
        stats_rebuilt = report.stats_rebuilt,
        "Consistency sweep finished"
    );
    Ok(report)
}

/// Read-only consistency check of the index against the content tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub entries: u64,
    pub total_size_bytes: ByteSize,
    /// Sources whose stored stats differ from the sum of their entries.
    pub stats_mismatches: Vec<String>,
    /// Entries whose blob is absent or has the wrong length.
    pub missing_blobs: Vec<CacheKey>,
    /// Blobs no entry points at.
    pub orphan_blobs: Vec<ContentPointer>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.stats_mismatches.is_empty()
            && self.missing_blobs.is_empty()
            && self.orphan_blobs.is_empty()
    }
}

/// Check every invariant the sweep would repair, without repairing anything.
pub async fn audit(index: &Arc<MetadataIndex>, content: &ContentStore) -> CacheResult<AuditReport> {
    let mut report = AuditReport::default();
    let entries = index.call(|index| index.all_entries()).await?;
    let stored = index.call(|index| index.all_source_stats()).await?;

    let mut expected: BTreeMap<String, SourceStats> = BTreeMap::new();
    let mut referenced = HashSet::with_capacity(entries.len());
    for entry in entries {
        report.entries += 1;
        report.total_size_bytes = report.total_size_bytes.saturating_add(entry.size_bytes);
        expected
            .entry(entry.source_id().to_string())
            .or_insert_with(|| SourceStats::empty(entry.source_id()))
            .add(entry.size_bytes);

        if content.len(&entry.pointer).await? != Some(entry.size_bytes) {
            report.missing_blobs.push(entry.key.clone());
        }
        referenced.insert(entry.pointer);
    }

    for stats in stored {
        let sums = expected.remove(&stats.source_id);
        let (size, count) = sums.map_or((0, 0), |s| (s.total_size_bytes, s.entry_count));
        if stats.total_size_bytes != size || stats.entry_count != count {
            report.stats_mismatches.push(stats.source_id);
        }
    }
    // Entries of a source with no stats row at all.
    report.stats_mismatches.extend(expected.into_keys());

    let (pointers, _) = content.list_pointers().await?;
    report.orphan_blobs = pointers
        .into_iter()
        .filter(|pointer| !referenced.contains(pointer))
        .collect();

    Ok(report)
}
