//! # Compaction Engine
//!
//! Folds rotated WAL files into a single compacted file so that warm
//! starts replay a short residual tail instead of the whole history.
//!
//! One compaction round:
//!
//! 1. **Selection** — every rotated `pwal_*` file not already listed as
//!    detached in the catalog, plus the previous compacted file. If any
//!    selected file still holds a session beyond the durable ceiling the
//!    whole round is deferred — that tail is recoverable only from the
//!    file itself, and folding tombstones around it could resurrect its
//!    older versions.
//! 2. **Merge** — scan the inputs through the same
//!    [`SnapshotBuilder`](crate::scanner::SnapshotBuilder) reduction used
//!    by recovery: greatest write version per (storage, key), tombstones
//!    erase equal-or-older versions, applied storage-lifecycle events are
//!    dropped.
//! 3. **Emit** — write the key-sorted, tombstone-free projection to a
//!    temporary file, fsync, and atomically rename it to
//!    `pwal_0000.compacted`.
//! 4. **Catalog update** — list the new compacted file, mark the consumed
//!    WAL files detached, record the max durable epoch, and rotate the
//!    previous catalog to its backup name.
//!
//! The rotation barrier that feeds this module and the BLOB GC scheduling
//! that follows it live in [`crate::datastore`]; at most one compaction
//! runs at a time (the datastore holds a dedicated mutex).
//!
//! Compaction is idempotent: compacting a database with no new writes
//! reproduces the same compacted file bytes.


use std::collections::BTreeSet;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{CatalogError, CompactedFileInfo, CompactionCatalog};
use crate::channel::PWAL_PREFIX;
use crate::fileio::FileOps;
use crate::record::{self, BlobId, EpochId, RecordError};
use crate::scanner::{self, COMPACTED_SUFFIX, RecoveryError, SnapshotBuilder};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Name of the merged compacted file inside the log directory.
pub const COMPACTED_FILE_NAME: &str = "pwal_0000.compacted";

/// Version stamped on compacted files in the catalog.
pub const COMPACTED_FORMAT_VERSION: u32 = 1;

const COMPACTED_TMP_SUFFIX: &str = ".tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that abort a compaction round. The catalog is only rewritten
/// after the new compacted file is in place, so a failed round leaves the
/// previous consistent state.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A selected input failed to scan.
    #[error("Scan error: {0}")]
    Scan(#[from] RecoveryError),

    /// Record framing failure while emitting the compacted file.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Catalog load/store failure.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

// ------------------------------------------------------------------------------------------------
// Outcome
// ------------------------------------------------------------------------------------------------

/// Result of one compaction round.
#[derive(Debug)]
pub struct CompactionOutcome {
    /// Path of the freshly written compacted file.
    pub compacted_path: PathBuf,

    /// Number of live entries in the compacted file.
    pub entry_count: usize,

    /// Highest BLOB id observed in any merge input (including superseded
    /// entries) — the GC candidate ceiling.
    pub max_blob_id_seen: BlobId,

    /// Max durable epoch recorded in the catalog.
    pub max_epoch: EpochId,

    /// WAL file names newly marked as detached.
    pub newly_detached: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// Compaction round
// ------------------------------------------------------------------------------------------------

/// Merges all eligible rotated WAL files (plus the previous compacted
/// file) into a new compacted file and updates the catalog.
///
/// `ceiling` is the max durable epoch at the rotation barrier; sessions
/// beyond it are not folded in. Returns `Ok(None)` when there is nothing
/// to compact.
pub fn compact_rotated_files(
    log_dir: &Path,
    catalog: &mut CompactionCatalog,
    ceiling: EpochId,
    ops: &dyn FileOps,
) -> Result<Option<CompactionOutcome>, CompactionError> {
    let inputs = select_rotated_files(log_dir, catalog, ops)?;
    let previous_compacted: Vec<PathBuf> = catalog
        .compacted_files()
        .iter()
        .map(|info| log_dir.join(&info.file_name))
        .filter(|path| ops.exists(path))
        .collect();

    if inputs.is_empty() && previous_compacted.is_empty() {
        debug!("no rotated files and no compacted base, compaction skipped");
        return Ok(None);
    }

    info!(
        rotated = inputs.len(),
        bases = previous_compacted.len(),
        ceiling,
        "compaction starting"
    );

    // Merge. The previous compacted file carries original write versions,
    // so input order does not matter. If any selected file still holds a
    // session beyond the ceiling, the whole round is deferred: folding
    // the other files' tombstones while that file stays residual could
    // let its older versions resurface.
    let mut builder = SnapshotBuilder::new();
    for path in &previous_compacted {
        scanner::scan_compacted_file_into(path, &mut builder)?;
    }
    for path in &inputs {
        let summary = scanner::scan_wal_file_into(path, ceiling, &mut builder)?;
        if summary.sessions_beyond_ceiling > 0 {
            info!(
                file = %path.display(),
                deferred_sessions = summary.sessions_beyond_ceiling,
                ceiling,
                "rotated file has sessions beyond the ceiling, round deferred"
            );
            return Ok(None);
        }
    }

    let max_blob_id_seen = builder.max_blob_id();
    let live = builder.finalize();
    let entry_count = live.len();

    // Emit atomically: write temp, fsync, rename.
    let compacted_path = log_dir.join(COMPACTED_FILE_NAME);
    let tmp_path = log_dir.join(format!("{COMPACTED_FILE_NAME}{COMPACTED_TMP_SUFFIX}"));
    {
        let file = ops.create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for rec in &live {
            record::write_record(&mut writer, rec)?;
        }
        writer.flush()?;
        let mut file = writer
            .into_inner()
            .map_err(|e| io::Error::other(e.to_string()))?;
        ops.flush_and_sync(&mut file)?;
    }
    ops.rename(&tmp_path, &compacted_path)?;

    // Catalog: the new compacted file replaces the old listing; consumed
    // rotated files join the detached set.
    let newly_detached: Vec<String> = inputs
        .iter()
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()))
        .map(str::to_string)
        .collect();

    let mut detached: BTreeSet<String> = catalog.detached_pwals().clone();
    detached.extend(newly_detached.iter().cloned());

    let compacted_files = BTreeSet::from([CompactedFileInfo {
        file_name: COMPACTED_FILE_NAME.to_string(),
        version: COMPACTED_FORMAT_VERSION,
    }]);

    catalog.update_catalog_file(ceiling, compacted_files, detached, ops)?;

    info!(
        entries = entry_count,
        max_blob_id_seen,
        detached = newly_detached.len(),
        "compaction finished"
    );
    Ok(Some(CompactionOutcome {
        compacted_path,
        entry_count,
        max_blob_id_seen,
        max_epoch: ceiling,
        newly_detached,
    }))
}

/// Rotated WAL files eligible for compaction: `pwal_*` names carrying a
/// rotation suffix, excluding the compacted file and already-detached
/// files.
fn select_rotated_files(
    log_dir: &Path,
    catalog: &CompactionCatalog,
    ops: &dyn FileOps,
) -> Result<Vec<PathBuf>, CompactionError> {
    let mut files = Vec::new();
    for path in ops.list_dir(log_dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(PWAL_PREFIX) || ops.is_dir(&path) {
            continue;
        }
        if name.ends_with(COMPACTED_SUFFIX) || name.ends_with(COMPACTED_TMP_SUFFIX) {
            continue;
        }
        // Active files have no rotation suffix and stay writable.
        let after_prefix = &name[PWAL_PREFIX.len()..];
        if !after_prefix.contains('.') {
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
