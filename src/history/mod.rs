//! # WAL History
//!
//! An append-only, fixed-record file marking rotation and branch points of
//! the log. Replicas compare their history against the primary's to decide
//! whether their WAL lineage is compatible before syncing.
//!
//! # On-disk layout
//!
//! 24 bytes per record, all fields big-endian:
//!
//! ```text
//! bytes  0–7   epoch id       (u64)
//! bytes  8–15  identity       (u64, first 8 bytes of a random UUID)
//! bytes 16–23  unix timestamp (i64, seconds)
//! ```
//!
//! # Update protocol
//!
//! Appending rewrites the whole file: read all records, add the new one,
//! write `wal_history.tmp`, flush + fsync, rename over `wal_history`. A
//! crash therefore leaves either the old file, the new file, or both — and
//! [`WalHistory::check_and_recover`] resolves each case on open (both →
//! drop the tmp; tmp only → promote it).

#[cfg(test)]
mod tests;

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fileio::FileOps;
use crate::record::EpochId;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// History file name inside the log directory.
pub const HISTORY_FILE_NAME: &str = "wal_history";

/// In-flight replacement file name.
pub const HISTORY_TMP_NAME: &str = "wal_history.tmp";

/// Fixed record size in bytes.
pub const RECORD_SIZE: usize = 24;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL-history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file length is not a multiple of the record size.
    #[error("Partial history record at end of file")]
    PartialRecord,
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// One rotation/branch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Epoch at which the rotation happened.
    pub epoch: EpochId,

    /// Random identity distinguishing divergent histories that share an
    /// epoch.
    pub identity: u64,

    /// Unix timestamp (seconds) of the rotation.
    pub timestamp: i64,
}

impl HistoryRecord {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&self.identity.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    fn parse(buf: &[u8; RECORD_SIZE]) -> Self {
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            u64::from_be_bytes(b)
        };
        let epoch = u64_at(0);
        let identity = u64_at(8);
        let timestamp = u64_at(16) as i64;
        Self {
            epoch,
            identity,
            timestamp,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalHistory
// ------------------------------------------------------------------------------------------------

/// Handle to the history file of one log directory.
#[derive(Debug)]
pub struct WalHistory {
    dir: PathBuf,
    ops: Arc<dyn FileOps>,
}

impl WalHistory {
    /// Binds a history handle to `dir`; nothing is created until the first
    /// [`append`](Self::append).
    pub fn new(dir: impl Into<PathBuf>, ops: Arc<dyn FileOps>) -> Self {
        Self {
            dir: dir.into(),
            ops,
        }
    }

    /// Path of the active history file.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE_NAME)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(HISTORY_TMP_NAME)
    }

    /// Appends a record for `epoch`, stamped with a fresh random identity
    /// and the current unix time, via write-temp-then-rename.
    pub fn append(&self, epoch: EpochId) -> Result<(), HistoryError> {
        let mut records = self.read_all()?;

        let uuid = Uuid::new_v4();
        let mut identity = 0u64;
        for byte in &uuid.as_bytes()[..8] {
            identity = (identity << 8) | u64::from(*byte);
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        records.push(HistoryRecord {
            epoch,
            identity,
            timestamp,
        });

        let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
        for rec in &records {
            rec.write_to(&mut buf);
        }

        let tmp = self.tmp_path();
        let mut file = self.ops.create(&tmp)?;
        file.write_all(&buf)?;
        self.ops.flush_and_sync(&mut file)?;
        drop(file);
        self.ops.rename(&tmp, &self.file_path())?;

        debug!(epoch, identity, "wal_history record appended");
        Ok(())
    }

    /// Returns all records in append order. A missing file yields an empty
    /// list.
    pub fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.read_all()
    }

    /// True if the history file exists.
    pub fn exists(&self) -> bool {
        self.ops.exists(&self.file_path())
    }

    /// Repairs an interrupted replace: both files present → the rename
    /// never happened, drop the tmp; tmp only → the active file was
    /// already replaced away, promote the tmp.
    pub fn check_and_recover(&self) -> Result<(), HistoryError> {
        let main = self.file_path();
        let tmp = self.tmp_path();
        let has_main = self.ops.exists(&main);
        let has_tmp = self.ops.exists(&tmp);

        if has_main && has_tmp {
            warn!(path = %tmp.display(), "rolling back interrupted wal_history replacement");
            self.ops.remove_file(&tmp)?;
        } else if !has_main && has_tmp {
            warn!(path = %tmp.display(), "promoting wal_history.tmp to wal_history");
            self.ops.rename(&tmp, &main)?;
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let path = self.file_path();
        if !self.ops.exists(&path) {
            return Ok(Vec::new());
        }

        let mut file = self.ops.open_read(&path)?;
        let mut records = Vec::new();
        let mut buf = [0u8; RECORD_SIZE];
        loop {
            let mut filled = 0;
            while filled < RECORD_SIZE {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(HistoryError::Io(e)),
                }
            }
            match filled {
                0 => break,
                RECORD_SIZE => records.push(HistoryRecord::parse(&buf)),
                _ => return Err(HistoryError::PartialRecord),
            }
        }
        Ok(records)
    }
}
