//! # Log Scanner & Recovery
//!
//! Turns the on-disk WAL state back into a consistent point-in-time image.
//! The recovery pass:
//!
//! 1. scans every WAL file under the log directory (active + rotated,
//!    minus the files the compaction catalog lists as detached) in a
//!    bounded-parallel pool,
//! 2. honors session markers: only regions closed by `marker_end` count;
//!    a region opened by `marker_invalidated_begin` (or torn off at end of
//!    file) is discarded,
//! 3. applies the durable-epoch ceiling: entries with major above the
//!    ceiling were never advertised durable and are dropped,
//! 4. reduces by (storage, key) keeping the greatest write version, where
//!    tombstones erase prior and equal-or-older versions and
//!    `clear_storage` / `remove_storage` wipe everything at or below
//!    their version,
//! 5. materializes the result, sorted by key_sid, into `data/snapshot`
//!    (write-temp, fsync, rename). Keys whose latest record is a
//!    tombstone (or that fell to a storage wipe) keep a tombstone in the
//!    snapshot so they shadow the compacted base at cursor-merge time;
//!    the cursor filters them from its output.
//!
//! A framing error in the middle of a file means the database is
//! corrupted: recovery aborts and the datastore refuses to open. Only a
//! cleanly truncated trailing record is tolerated, and then only because
//! the unclosed region it belongs to is discarded anyway.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::CompactionCatalog;
use crate::channel::PWAL_PREFIX;
use crate::fileio::FileOps;
use crate::record::{self, BlobId, EpochId, LogRecord, RecordError, StorageId, WriteVersion};
use crate::snapshot::{SNAPSHOT_FILE_NAME, SNAPSHOT_SUBDIRECTORY};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Suffix of the compacted file, which is never scanned as WAL input.
pub const COMPACTED_SUFFIX: &str = ".compacted";

const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that abort recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A WAL file is corrupted beyond the tolerated torn tail.
    #[error("Corrupted WAL file {file}: {source}")]
    Record {
        /// File that failed.
        file: PathBuf,
        /// The framing error.
        source: RecordError,
    },

    /// A record sequence that no writer produces (e.g. a data entry
    /// outside any session).
    #[error("Malformed WAL file {file}: {reason}")]
    Malformed {
        /// File that failed.
        file: PathBuf,
        /// What was wrong.
        reason: String,
    },
}

// ------------------------------------------------------------------------------------------------
// SnapshotBuilder — the (storage, key) reduction
// ------------------------------------------------------------------------------------------------

/// Accumulates scanned records and reduces them to the authoritative
/// record per (storage, key). Shared by recovery and compaction.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    /// Best data record per key_sid.
    entries: BTreeMap<Vec<u8>, LogRecord>,

    /// Highest wipe version per storage (clear_storage / remove_storage).
    storage_wipes: BTreeMap<StorageId, WriteVersion>,

    /// Highest BLOB id referenced by any applied record.
    max_blob_id: BlobId,
}

impl SnapshotBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest BLOB id seen so far.
    pub fn max_blob_id(&self) -> BlobId {
        self.max_blob_id
    }

    /// Applies one committed data record.
    pub fn apply(&mut self, rec: LogRecord) {
        for id in rec.blob_ids() {
            self.max_blob_id = self.max_blob_id.max(*id);
        }

        match &rec {
            LogRecord::NormalEntry { .. }
            | LogRecord::NormalWithBlob { .. }
            | LogRecord::RemoveEntry { .. } => {
                let Some(sid) = rec.key_sid() else { return };
                match self.entries.entry(sid) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(rec);
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        if supersedes(&rec, slot.get()) {
                            slot.insert(rec);
                        }
                    }
                }
            }
            LogRecord::ClearStorage {
                storage,
                write_version,
            }
            | LogRecord::RemoveStorage {
                storage,
                write_version,
            } => {
                let wipe = self.storage_wipes.entry(*storage).or_default();
                *wipe = (*wipe).max(*write_version);
            }
            // add_storage registers the namespace; it leaves no key state.
            LogRecord::AddStorage { .. } => {}
            _ => {}
        }
    }

    /// Merges another builder (from a parallel scan worker).
    pub fn merge(&mut self, other: SnapshotBuilder) {
        for (_, rec) in other.entries {
            self.apply(rec);
        }
        for (storage, wipe) in other.storage_wipes {
            let slot = self.storage_wipes.entry(storage).or_default();
            *slot = (*slot).max(wipe);
        }
        self.max_blob_id = self.max_blob_id.max(other.max_blob_id);
    }

    /// Resolves wipes and tombstones, yielding the live records in
    /// key_sid order. Used for the compacted file, which is the lowest
    /// layer and therefore never needs to shadow anything beneath it.
    pub fn finalize(self) -> Vec<LogRecord> {
        let wipes = self.storage_wipes;
        self.entries
            .into_values()
            .filter(|rec| {
                if rec.is_tombstone() {
                    return false;
                }
                let (Some(storage), Some(version)) = (rec.storage(), rec.write_version()) else {
                    return false;
                };
                match wipes.get(&storage) {
                    Some(wipe) => version > *wipe,
                    None => true,
                }
            })
            .collect()
    }

    /// Decomposes the builder for callers that resolve the reduction
    /// themselves (the residual-snapshot writer).
    pub fn into_parts(
        self,
    ) -> (
        BTreeMap<Vec<u8>, LogRecord>,
        BTreeMap<StorageId, WriteVersion>,
        BlobId,
    ) {
        (self.entries, self.storage_wipes, self.max_blob_id)
    }
}

/// True if `candidate` beats `incumbent` for the same key: greater write
/// version wins; on a tie the tombstone wins (tombstones erase
/// equal-or-older versions).
fn supersedes(candidate: &LogRecord, incumbent: &LogRecord) -> bool {
    let (Some(cv), Some(iv)) = (candidate.write_version(), incumbent.write_version()) else {
        return false;
    };
    cv > iv || (cv == iv && candidate.is_tombstone() && !incumbent.is_tombstone())
}

// ------------------------------------------------------------------------------------------------
// Single-file scan
// ------------------------------------------------------------------------------------------------

/// What one WAL file contributed to a scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalFileSummary {
    /// Complete sessions applied to the builder.
    pub sessions_applied: usize,

    /// Complete sessions skipped because their epoch exceeds the ceiling.
    /// These stay recoverable only from this file — a caller that intends
    /// to detach the file must see zero here.
    pub sessions_beyond_ceiling: usize,

    /// Regions discarded (invalidated or torn).
    pub dropped_regions: usize,

    /// Byte length of the durable prefix: everything past this offset is
    /// only beyond-ceiling sessions, torn regions, or trailing
    /// invalidated content, and may be cut off by recovery repair.
    pub durable_prefix_len: u64,
}

/// Streams one WAL file into `builder`, honoring session markers, the
/// invalidation marker, and the durable ceiling.
pub fn scan_wal_file_into(
    path: &Path,
    ceiling: EpochId,
    builder: &mut SnapshotBuilder,
) -> Result<WalFileSummary, RecoveryError> {
    let file = std::fs::File::open(path)?;
    let mut reader = record::RecordReader::new(BufReader::new(file));

    // Buffered records of the currently open session, if any.
    let mut open_session: Option<(EpochId, Vec<LogRecord>)> = None;
    let mut summary = WalFileSummary::default();

    while let Some(item) = reader.next() {
        let rec = match item {
            Ok(rec) => rec,
            Err(RecordError::TruncatedRecord) => {
                // Torn tail: legal only because the unclosed region it
                // belongs to is dropped below.
                if open_session.is_some() {
                    summary.dropped_regions += 1;
                    open_session = None;
                }
                break;
            }
            Err(source) => {
                return Err(RecoveryError::Record {
                    file: path.to_path_buf(),
                    source,
                });
            }
        };

        match rec {
            LogRecord::MarkerBegin { epoch } => {
                if open_session.is_some() {
                    // Begin without end: the previous region is torn.
                    summary.dropped_regions += 1;
                }
                open_session = Some((epoch, Vec::new()));
            }
            LogRecord::MarkerEnd { epoch } => {
                match open_session.take() {
                    Some((begin_epoch, buffered)) if begin_epoch == epoch => {
                        if epoch <= ceiling {
                            for rec in buffered {
                                builder.apply(rec);
                            }
                            summary.sessions_applied += 1;
                            summary.durable_prefix_len = reader.position();
                        } else {
                            debug!(file = %path.display(), epoch, ceiling,
                                   "session beyond durable ceiling dropped");
                            summary.sessions_beyond_ceiling += 1;
                        }
                    }
                    _ => {
                        return Err(RecoveryError::Malformed {
                            file: path.to_path_buf(),
                            reason: format!("marker_end({epoch}) without matching marker_begin"),
                        });
                    }
                }
            }
            LogRecord::MarkerInvalidatedBegin { .. } => {
                // Supersedes the prior marker_begin: region dropped.
                open_session = None;
                summary.dropped_regions += 1;
            }
            LogRecord::MarkerDurable { .. } => {
                return Err(RecoveryError::Malformed {
                    file: path.to_path_buf(),
                    reason: "durable marker inside a channel WAL file".into(),
                });
            }
            data => match &mut open_session {
                Some((_, buffered)) => buffered.push(data),
                None => {
                    return Err(RecoveryError::Malformed {
                        file: path.to_path_buf(),
                        reason: "data entry outside any session".into(),
                    });
                }
            },
        }
    }

    if open_session.is_some() {
        // File ended mid-session with no invalidation marker (crash
        // before the writer could seal it).
        summary.dropped_regions += 1;
    }
    if summary.dropped_regions > 0 {
        warn!(
            file = %path.display(),
            dropped = summary.dropped_regions,
            "invalidated regions dropped"
        );
    }
    Ok(summary)
}

/// Streams a compacted file (plain sorted records, no session markers)
/// into `builder`.
pub fn scan_compacted_file_into(
    path: &Path,
    builder: &mut SnapshotBuilder,
) -> Result<(), RecoveryError> {
    let file = std::fs::File::open(path)?;
    let reader = record::RecordReader::new(BufReader::new(file));
    for item in reader {
        let rec = item.map_err(|source| RecoveryError::Record {
            file: path.to_path_buf(),
            source,
        })?;
        builder.apply(rec);
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// WAL file discovery
// ------------------------------------------------------------------------------------------------

/// Collects the WAL files that feed the snapshot: active and rotated
/// `pwal_*` files, minus the compacted file and the catalog's detached
/// set.
pub fn collect_wal_files(
    log_dir: &Path,
    catalog: &CompactionCatalog,
    ops: &dyn FileOps,
) -> Result<Vec<PathBuf>, RecoveryError> {
    let mut files = Vec::new();
    for path in ops.list_dir(log_dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(PWAL_PREFIX) || ops.is_dir(&path) {
            continue;
        }
        // The compacted file is merged by the cursor, not scanned as WAL;
        // a .tmp is an in-flight replacement that never counts.
        if name.ends_with(COMPACTED_SUFFIX) || name.ends_with(".tmp") {
            continue;
        }
        if catalog.detached_pwals().contains(name) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

// ------------------------------------------------------------------------------------------------
// Recovery entry point
// ------------------------------------------------------------------------------------------------

/// Result of a completed recovery pass.
#[derive(Debug)]
pub struct RecoveredImage {
    /// Path of the materialized snapshot (`data/snapshot`).
    pub snapshot_path: PathBuf,

    /// Number of live (non-tombstone) entries in the snapshot.
    pub entry_count: usize,

    /// Highest BLOB id referenced anywhere in the scanned state.
    pub max_blob_id: BlobId,
}

/// Runs the full recovery pass and materializes `data/snapshot`.
///
/// `ceiling` is the recovery ceiling (the max durable epoch from the
/// epoch files); `max_parallelism` bounds the scan worker pool.
pub fn build_snapshot(
    log_dir: &Path,
    catalog: &CompactionCatalog,
    ceiling: EpochId,
    max_parallelism: usize,
    ops: &dyn FileOps,
) -> Result<RecoveredImage, RecoveryError> {
    let files = collect_wal_files(log_dir, catalog, ops)?;
    info!(
        files = files.len(),
        ceiling, max_parallelism, "recovery scan starting"
    );

    let (builder, summaries) = scan_files_parallel(&files, ceiling, max_parallelism)?;

    // Recovery repair: cut every WAL file back to its durable prefix.
    // Beyond-ceiling sessions were never advertised durable; leaving them
    // in place would let a re-used epoch make them visible later.
    for (path, summary) in &summaries {
        let file_len = ops.file_len(path)?;
        if summary.durable_prefix_len < file_len {
            warn!(
                file = %path.display(),
                from = file_len,
                to = summary.durable_prefix_len,
                "truncating non-durable wal tail"
            );
            ops.truncate(path, summary.durable_prefix_len)?;
        }
    }

    let (entries, wipes, mut max_blob_id) = builder.into_parts();

    // Resolve the residual layer. Unlike the compacted file, the snapshot
    // sits ABOVE the compacted base in the cursor merge, so deletions
    // must stay visible: a key whose latest record is a tombstone keeps
    // that tombstone, and an entry covered by a storage wipe becomes one.
    // The cursor consumes the shadowed base entry on the key tie and
    // filters the tombstone from its output.
    let mut residual: BTreeMap<Vec<u8>, LogRecord> = BTreeMap::new();
    for (sid, rec) in entries {
        let (Some(storage), Some(version)) = (rec.storage(), rec.write_version()) else {
            continue;
        };
        let wipe = wipes.get(&storage).copied();
        let wiped = wipe.is_some_and(|w| version <= w);
        if rec.is_tombstone() || wiped {
            let Some(key) = rec.key() else { continue };
            let write_version = wipe.map_or(version, |w| w.max(version));
            residual.insert(
                sid,
                LogRecord::RemoveEntry {
                    storage,
                    key: key.to_vec(),
                    write_version,
                },
            );
        } else {
            residual.insert(sid, rec);
        }
    }

    // The compacted base is merged at read time, not rewritten here — but
    // its keys covered by a storage wipe need a shadowing tombstone in
    // the residual, and its blob ids seed the allocator.
    for info in catalog.compacted_files() {
        let path = log_dir.join(&info.file_name);
        if !ops.exists(&path) {
            continue;
        }
        let file = std::fs::File::open(&path)?;
        for item in record::RecordReader::new(BufReader::new(file)) {
            let rec = item.map_err(|source| RecoveryError::Record {
                file: path.clone(),
                source,
            })?;
            for id in rec.blob_ids() {
                max_blob_id = max_blob_id.max(*id);
            }
            let Some(sid) = rec.key_sid() else { continue };
            if residual.contains_key(&sid) {
                continue;
            }
            if let (Some(storage), Some(version)) = (rec.storage(), rec.write_version())
                && let Some(wipe) = wipes.get(&storage)
                && version <= *wipe
                && let Some(key) = rec.key()
            {
                residual.insert(
                    sid,
                    LogRecord::RemoveEntry {
                        storage,
                        key: key.to_vec(),
                        write_version: *wipe,
                    },
                );
            }
        }
    }

    let live: Vec<LogRecord> = residual.into_values().collect();
    let entry_count = live.iter().filter(|rec| !rec.is_tombstone()).count();

    let snapshot_dir = log_dir.join(SNAPSHOT_SUBDIRECTORY);
    ops.create_dir_all(&snapshot_dir)?;
    let snapshot_path = snapshot_dir.join(SNAPSHOT_FILE_NAME);
    let tmp_path = snapshot_dir.join(format!("{SNAPSHOT_FILE_NAME}{SNAPSHOT_TMP_SUFFIX}"));

    {
        let file = ops.create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for rec in &live {
            record::write_record(&mut writer, rec).map_err(|source| RecoveryError::Record {
                file: tmp_path.clone(),
                source,
            })?;
        }
        writer.flush()?;
        let mut file = writer.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
        ops.flush_and_sync(&mut file)?;
    }
    ops.rename(&tmp_path, &snapshot_path)?;

    info!(
        entries = entry_count,
        max_blob_id,
        snapshot = %snapshot_path.display(),
        "snapshot materialized"
    );
    Ok(RecoveredImage {
        snapshot_path,
        entry_count,
        max_blob_id,
    })
}

/// Scans `files` with up to `max_parallelism` workers, merging the
/// per-worker builders and collecting the per-file summaries.
fn scan_files_parallel(
    files: &[PathBuf],
    ceiling: EpochId,
    max_parallelism: usize,
) -> Result<(SnapshotBuilder, Vec<(PathBuf, WalFileSummary)>), RecoveryError> {
    let workers = max_parallelism.max(1).min(files.len().max(1));
    if workers <= 1 {
        let mut builder = SnapshotBuilder::new();
        let mut summaries = Vec::with_capacity(files.len());
        for path in files {
            let summary = scan_wal_file_into(path, ceiling, &mut builder)?;
            summaries.push((path.clone(), summary));
        }
        return Ok((builder, summaries));
    }

    let next_file = AtomicUsize::new(0);
    let merged: Mutex<SnapshotBuilder> = Mutex::new(SnapshotBuilder::new());
    let all_summaries: Mutex<Vec<(PathBuf, WalFileSummary)>> = Mutex::new(Vec::new());
    let first_error: Mutex<Option<RecoveryError>> = Mutex::new(None);

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                let mut local = SnapshotBuilder::new();
                let mut local_summaries = Vec::new();
                loop {
                    let index = next_file.fetch_add(1, Ordering::SeqCst);
                    let Some(path) = files.get(index) else { break };
                    match scan_wal_file_into(path, ceiling, &mut local) {
                        Ok(summary) => local_summaries.push((path.clone(), summary)),
                        Err(e) => {
                            let mut slot = match first_error.lock() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            slot.get_or_insert(e);
                            return;
                        }
                    }
                }
                let mut sink = match merged.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                sink.merge(local);
                drop(sink);
                let mut sink = match all_summaries.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                sink.extend(local_summaries);
            });
        }
    })
    .map_err(|_| io::Error::other("recovery scan worker panicked"))?;

    if let Some(error) = first_error
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
    {
        return Err(error);
    }
    let builder = merged
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let summaries = all_summaries
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Ok((builder, summaries))
}
