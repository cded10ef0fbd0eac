//! # Compaction Catalog
//!
//! The textual index of compaction state: which compacted files exist (and
//! at which version), which rotated WAL files have been folded into them
//! (**detached** — no longer needed for recovery), and the maximum epoch
//! observed at the time of compaction.
//!
//! The catalog is intentionally human-readable so that partial corruption
//! can be diagnosed without tooling.
//!
//! # On-disk layout
//!
//! ```text
//! COMPACTION_CATALOG_HEADER
//! COMPACTED_FILE <name> <version>
//! ...
//! DETACHED_PWAL <name>
//! ...
//! MAX_EPOCH_ID <epoch>
//! COMPACTION_CATALOG_FOOTER
//! ```
//!
//! Loading requires the header line, exactly one `MAX_EPOCH_ID`, and the
//! footer line; unknown keywords are a parse error. On a load failure the
//! backup file is consulted and, if valid, promoted to primary via rename.
//!
//! Writing renders the whole catalog into a buffer, renames the existing
//! primary to its backup name, then creates the primary and writes +
//! flushes + fsyncs it — a crash at any point leaves at least one loadable
//! copy.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fileio::FileOps;
use crate::record::EpochId;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Catalog file name inside the log directory.
pub const CATALOG_FILE_NAME: &str = "compaction_catalog";

/// Catalog backup file name.
pub const CATALOG_BACKUP_NAME: &str = "compaction_catalog.back";

const HEADER_LINE: &str = "COMPACTION_CATALOG_HEADER";
const FOOTER_LINE: &str = "COMPACTION_CATALOG_FOOTER";
const COMPACTED_FILE_KEY: &str = "COMPACTED_FILE";
const DETACHED_PWAL_KEY: &str = "DETACHED_PWAL";
const MAX_EPOCH_ID_KEY: &str = "MAX_EPOCH_ID";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by catalog load/store operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The catalog text does not conform to the expected layout.
    #[error("Catalog parse error: {0}")]
    Parse(String),
}

// ------------------------------------------------------------------------------------------------
// Catalog data
// ------------------------------------------------------------------------------------------------

/// One compacted file listed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompactedFileInfo {
    /// File name relative to the log directory.
    pub file_name: String,

    /// Compacted-format version of the file.
    pub version: u32,
}

/// In-memory compaction catalog with its primary/backup file paths.
#[derive(Debug)]
pub struct CompactionCatalog {
    catalog_path: PathBuf,
    backup_path: PathBuf,
    max_epoch_id: EpochId,
    compacted_files: BTreeSet<CompactedFileInfo>,
    detached_pwals: BTreeSet<String>,
}

impl CompactionCatalog {
    /// Creates an empty catalog bound to `directory` (nothing is written
    /// until [`update_catalog_file`](Self::update_catalog_file)).
    pub fn new(directory: &Path) -> Self {
        Self {
            catalog_path: directory.join(CATALOG_FILE_NAME),
            backup_path: directory.join(CATALOG_BACKUP_NAME),
            max_epoch_id: 0,
            compacted_files: BTreeSet::new(),
            detached_pwals: BTreeSet::new(),
        }
    }

    /// Loads the catalog from `directory`, falling back to the backup file
    /// (and promoting it to primary) when the primary fails to load.
    ///
    /// A directory with neither file yields an empty catalog — the state
    /// of a database that has never compacted.
    pub fn from_catalog_file(directory: &Path, ops: &dyn FileOps) -> Result<Self, CatalogError> {
        let mut catalog = Self::new(directory);

        if !ops.exists(&catalog.catalog_path) && !ops.exists(&catalog.backup_path) {
            debug!(dir = %directory.display(), "no compaction catalog present");
            return Ok(catalog);
        }

        match catalog.load_file(&catalog.catalog_path.clone()) {
            Ok(()) => Ok(catalog),
            Err(primary_err) => {
                if !ops.exists(&catalog.backup_path) {
                    return Err(CatalogError::Parse(format!(
                        "failed to load catalog and no backup available: {primary_err}"
                    )));
                }
                warn!(
                    error = %primary_err,
                    "catalog load failed, restoring from backup"
                );
                catalog.load_file(&catalog.backup_path.clone())?;

                // Promote the backup to primary.
                if ops.exists(&catalog.catalog_path) {
                    ops.remove_file(&catalog.catalog_path)?;
                }
                ops.rename(&catalog.backup_path, &catalog.catalog_path)?;
                Ok(catalog)
            }
        }
    }

    /// Replaces the catalog contents and persists them: render, rename the
    /// previous primary to the backup name, create the primary, write +
    /// flush + fsync.
    pub fn update_catalog_file(
        &mut self,
        max_epoch_id: EpochId,
        compacted_files: BTreeSet<CompactedFileInfo>,
        detached_pwals: BTreeSet<String>,
        ops: &dyn FileOps,
    ) -> Result<(), CatalogError> {
        self.max_epoch_id = max_epoch_id;
        self.compacted_files = compacted_files;
        self.detached_pwals = detached_pwals;

        let content = self.render();

        if ops.exists(&self.catalog_path) {
            ops.rename(&self.catalog_path, &self.backup_path)?;
        }

        let mut file = ops.create(&self.catalog_path)?;
        file.write_all(content.as_bytes())?;
        ops.flush_and_sync(&mut file)?;

        info!(
            max_epoch_id,
            compacted = self.compacted_files.len(),
            detached = self.detached_pwals.len(),
            "compaction catalog updated"
        );
        Ok(())
    }

    /// Maximum durable epoch recorded at the last compaction.
    pub fn max_epoch_id(&self) -> EpochId {
        self.max_epoch_id
    }

    /// Compacted files listed in the catalog.
    pub fn compacted_files(&self) -> &BTreeSet<CompactedFileInfo> {
        &self.compacted_files
    }

    /// Rotated WAL file names already folded into a compacted file.
    pub fn detached_pwals(&self) -> &BTreeSet<String> {
        &self.detached_pwals
    }

    // --------------------------------------------------------------------------------------------
    // Parsing
    // --------------------------------------------------------------------------------------------

    fn load_file(&mut self, path: &Path) -> Result<(), CatalogError> {
        let content = std::fs::read_to_string(path)?;
        let mut lines = content.lines();

        match lines.next() {
            Some(line) if line == HEADER_LINE => {}
            other => {
                return Err(CatalogError::Parse(format!(
                    "invalid or missing header line: {other:?}"
                )));
            }
        }

        let mut compacted_files = BTreeSet::new();
        let mut detached_pwals = BTreeSet::new();
        let mut max_epoch_id: Option<EpochId> = None;

        for line in lines {
            if line == FOOTER_LINE {
                let max_epoch_id = max_epoch_id
                    .ok_or_else(|| CatalogError::Parse("MAX_EPOCH_ID entry not found".into()))?;
                self.compacted_files = compacted_files;
                self.detached_pwals = detached_pwals;
                self.max_epoch_id = max_epoch_id;
                return Ok(());
            }
            Self::parse_entry(
                line,
                &mut compacted_files,
                &mut detached_pwals,
                &mut max_epoch_id,
            )?;
        }

        Err(CatalogError::Parse("missing footer line".into()))
    }

    fn parse_entry(
        line: &str,
        compacted_files: &mut BTreeSet<CompactedFileInfo>,
        detached_pwals: &mut BTreeSet<String>,
        max_epoch_id: &mut Option<EpochId>,
    ) -> Result<(), CatalogError> {
        let mut fields = line.split_whitespace();
        let Some(keyword) = fields.next() else {
            return Ok(()); // skip empty lines
        };

        match keyword {
            COMPACTED_FILE_KEY => {
                let (name, version) = match (fields.next(), fields.next()) {
                    (Some(name), Some(version)) => (name, version),
                    _ => {
                        return Err(CatalogError::Parse(format!(
                            "invalid format for {COMPACTED_FILE_KEY}: {line}"
                        )));
                    }
                };
                let version: u32 = version.parse().map_err(|_| {
                    CatalogError::Parse(format!("invalid format for {COMPACTED_FILE_KEY}: {line}"))
                })?;
                compacted_files.insert(CompactedFileInfo {
                    file_name: name.to_string(),
                    version,
                });
            }
            DETACHED_PWAL_KEY => {
                let Some(name) = fields.next() else {
                    return Err(CatalogError::Parse(format!(
                        "invalid format for {DETACHED_PWAL_KEY}: {line}"
                    )));
                };
                detached_pwals.insert(name.to_string());
            }
            MAX_EPOCH_ID_KEY => {
                let epoch: EpochId = fields
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        CatalogError::Parse(format!("invalid format for {MAX_EPOCH_ID_KEY}: {line}"))
                    })?;
                *max_epoch_id = Some(epoch);
            }
            other => {
                return Err(CatalogError::Parse(format!("unknown entry type: {other}")));
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Rendering
    // --------------------------------------------------------------------------------------------

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER_LINE);
        out.push('\n');

        for info in &self.compacted_files {
            out.push_str(COMPACTED_FILE_KEY);
            out.push(' ');
            out.push_str(&info.file_name);
            out.push(' ');
            out.push_str(&info.version.to_string());
            out.push('\n');
        }

        for pwal in &self.detached_pwals {
            out.push_str(DETACHED_PWAL_KEY);
            out.push(' ');
            out.push_str(pwal);
            out.push('\n');
        }

        out.push_str(MAX_EPOCH_ID_KEY);
        out.push(' ');
        out.push_str(&self.max_epoch_id.to_string());
        out.push('\n');

        out.push_str(FOOTER_LINE);
        out.push('\n');
        out
    }
}
