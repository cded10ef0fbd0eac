//! # Manifest Component
//!
//! The manifest is the small JSON document that identifies the on-disk
//! format of a log directory. It carries two keys:
//!
//! - `"format_version"` — the manifest schema version (string, `"1.0"`),
//! - `"persistent_format_version"` — the integer version of the WAL /
//!   snapshot / catalog layout (current: 4).
//!
//! ## Crash-recovery model
//!
//! The manifest is replaced atomically (write-new, rename-old-to-backup,
//! remove-backup), so a crash can leave the directory in one of four
//! states. [`check_and_migrate`] repairs them on open:
//!
//! 1. primary only — normal, nothing to do;
//! 2. primary + backup — the replacement completed, remove the backup;
//! 3. backup only — the replacement lost the primary, promote the backup;
//! 4. neither — fresh directory, [`create_initial`] runs first.
//!
//! A manifest whose `persistent_format_version` is *older* than the current
//! one is migrated in place through the same atomic-replace sequence; a
//! *newer* (or unparsable) version is a fatal format error — the datastore
//! refuses to open.
//!
//! ## Single-writer lock
//!
//! The datastore holds an exclusive advisory lock on the manifest file for
//! its whole lifetime ([`acquire_lock`]); a second process opening the same
//! directory fails fast instead of corrupting the log.


use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fileio::FileOps;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Manifest file name inside the log directory.
pub const MANIFEST_FILE_NAME: &str = "limestone-manifest.json";

/// Manifest backup file name, present only transiently.
pub const MANIFEST_BACKUP_NAME: &str = "limestone-manifest.json.back";

/// Manifest schema version.
pub const FORMAT_VERSION: &str = "1.0";

/// Current persistent (WAL/snapshot/catalog) format version.
pub const PERSISTENT_FORMAT_VERSION: u32 = 4;

const MIGRATION_TMP_SUFFIX: &str = ".migrating";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest file is not valid JSON or misses required keys.
    #[error("Manifest parse error: {0}")]
    Parse(String),

    /// The directory was written by an incompatible (newer) format.
    #[error("Unsupported persistent format version: {found} (supported: 1..={PERSISTENT_FORMAT_VERSION})")]
    UnsupportedVersion {
        /// The version found on disk.
        found: u32,
    },

    /// Another process holds the manifest lock.
    #[error("Log directory is locked by another process: {0}")]
    Locked(String),
}

// ------------------------------------------------------------------------------------------------
// Manifest document
// ------------------------------------------------------------------------------------------------

/// The serialized manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDoc {
    /// Manifest schema version (currently `"1.0"`).
    pub format_version: String,

    /// Persistent on-disk format version.
    pub persistent_format_version: u32,
}

impl ManifestDoc {
    /// The document written for newly created log directories.
    pub fn current() -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            persistent_format_version: PERSISTENT_FORMAT_VERSION,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Path helpers
// ------------------------------------------------------------------------------------------------

/// Path of the manifest inside `logdir`.
pub fn manifest_path(logdir: &Path) -> PathBuf {
    logdir.join(MANIFEST_FILE_NAME)
}

/// Path of the manifest backup inside `logdir`.
pub fn backup_path(logdir: &Path) -> PathBuf {
    logdir.join(MANIFEST_BACKUP_NAME)
}

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// Writes the initial manifest into `logdir` if none exists yet.
pub fn create_initial(logdir: &Path, ops: &dyn FileOps) -> Result<(), ManifestError> {
    let path = manifest_path(logdir);
    if ops.exists(&path) || ops.exists(&backup_path(logdir)) {
        return Ok(());
    }

    write_doc(&path, &ManifestDoc::current(), ops)?;
    info!(path = %path.display(), "manifest created");
    Ok(())
}

/// Acquires the exclusive single-writer lock on the manifest file.
///
/// The returned handle must be kept alive for the lifetime of the
/// datastore; dropping it releases the lock.
pub fn acquire_lock(logdir: &Path) -> Result<File, ManifestError> {
    let path = manifest_path(logdir);
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| ManifestError::Locked(path.display().to_string()))?;
    debug!(path = %path.display(), "manifest lock acquired");
    Ok(file)
}

/// Repairs a partially-replaced manifest, validates its format version,
/// and migrates older versions in place.
///
/// Returns the persistent format version the directory had *before* any
/// migration.
pub fn check_and_migrate(logdir: &Path, ops: &dyn FileOps) -> Result<u32, ManifestError> {
    let primary = manifest_path(logdir);
    let backup = backup_path(logdir);

    // Crash recovery of the replace sequence.
    let has_primary = ops.exists(&primary);
    let has_backup = ops.exists(&backup);
    if has_primary && has_backup {
        warn!(path = %backup.display(), "removing stale manifest backup");
        ops.remove_file(&backup)?;
    } else if !has_primary && has_backup {
        warn!(path = %backup.display(), "promoting manifest backup to primary");
        ops.rename(&backup, &primary)?;
    } else if !has_primary {
        return Err(ManifestError::Parse("manifest file not found".into()));
    }

    let doc = read_doc(&primary)?;
    let found = doc.persistent_format_version;

    match found {
        PERSISTENT_FORMAT_VERSION => Ok(found),
        1..PERSISTENT_FORMAT_VERSION => {
            migrate(logdir, found, ops)?;
            Ok(found)
        }
        _ => Err(ManifestError::UnsupportedVersion { found }),
    }
}

/// Replaces the manifest with the current version: write-new,
/// rename-old-to-backup, rename-new-to-primary, remove-backup.
fn migrate(logdir: &Path, from_version: u32, ops: &dyn FileOps) -> Result<(), ManifestError> {
    let primary = manifest_path(logdir);
    let backup = backup_path(logdir);
    let tmp = logdir.join(format!("{MANIFEST_FILE_NAME}{MIGRATION_TMP_SUFFIX}"));

    info!(
        from = from_version,
        to = PERSISTENT_FORMAT_VERSION,
        "migrating manifest"
    );

    write_doc(&tmp, &ManifestDoc::current(), ops)?;
    ops.rename(&primary, &backup)?;
    ops.rename(&tmp, &primary)?;
    ops.remove_file(&backup)?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Document I/O
// ------------------------------------------------------------------------------------------------

fn read_doc(path: &Path) -> Result<ManifestDoc, ManifestError> {
    let bytes = std::fs::read(path)?;
    let doc: ManifestDoc = serde_json::from_slice(&bytes)
        .map_err(|e| ManifestError::Parse(format!("{}: {e}", path.display())))?;
    if doc.format_version != FORMAT_VERSION {
        return Err(ManifestError::Parse(format!(
            "unsupported format_version {:?}",
            doc.format_version
        )));
    }
    Ok(doc)
}

fn write_doc(path: &Path, doc: &ManifestDoc, ops: &dyn FileOps) -> Result<(), ManifestError> {
    let json = serde_json::to_vec_pretty(doc)
        .map_err(|e| ManifestError::Parse(format!("serialize: {e}")))?;
    let mut file = ops.create(path)?;
    file.write_all(&json)?;
    ops.flush_and_sync(&mut file)?;
    Ok(())
}
