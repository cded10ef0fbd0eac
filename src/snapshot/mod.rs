//! # Snapshot Cursor
//!
//! Streams the recovery image as a single ordered sequence of entries.
//! The image has up to two inputs, both sorted by key_sid (big-endian
//! storage id ++ key):
//!
//! - the **snapshot** file materialized from the residual WAL tail at
//!   recovery (`data/snapshot`), and
//! - the **compacted** base file produced by the last compaction.
//!
//! ## Merge rules
//!
//! - Each input must be individually non-decreasing in key_sid; a
//!   violation is a fatal read error.
//! - When both inputs hold the same key_sid, the snapshot entry wins — it
//!   reflects rotations newer than the compacted base — and both entries
//!   are consumed.
//! - Tombstones in the merged stream are dropped silently.
//!
//! The cursor is stateful and read-once: [`SnapshotCursor::next`] yields
//! entries until both inputs are exhausted.
//!
//! The compacted input is immutable after its atomic rename, so it is
//! memory-mapped; the snapshot input is read through a buffered stream.


use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::record::{self, BlobId, LogRecord, RecordError, StorageId, WriteVersion};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Subdirectory of the log directory holding the snapshot.
pub const SNAPSHOT_SUBDIRECTORY: &str = "data";

/// Snapshot file name inside [`SNAPSHOT_SUBDIRECTORY`].
pub const SNAPSHOT_FILE_NAME: &str = "snapshot";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while streaming the snapshot.
#[derive(Debug, Error)]
pub enum CursorError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing or decoding failure.
    #[error("Record error in {stream} stream: {source}")]
    Record {
        /// Which input failed.
        stream: &'static str,
        /// The framing error.
        source: RecordError,
    },

    /// An input produced keys out of order.
    #[error("Key order violation detected in {stream} stream")]
    KeyOrderViolation {
        /// Which input violated the ordering.
        stream: &'static str,
    },

    /// An input contained a record kind that never belongs in a snapshot.
    #[error("Unexpected record kind in {stream} stream")]
    UnexpectedRecord {
        /// Which input produced it.
        stream: &'static str,
    },
}

// ------------------------------------------------------------------------------------------------
// SnapshotEntry
// ------------------------------------------------------------------------------------------------

/// One live key/value of the recovery image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Owning storage.
    pub storage: StorageId,

    /// Key bytes.
    pub key: Vec<u8>,

    /// Value bytes.
    pub value: Vec<u8>,

    /// Version that produced this value.
    pub write_version: WriteVersion,

    /// Referenced BLOB ids; empty for plain entries.
    pub blob_ids: Vec<BlobId>,
}

// ------------------------------------------------------------------------------------------------
// Input streams
// ------------------------------------------------------------------------------------------------

enum Input {
    Buffered(BufReader<File>),
    Mapped { map: Mmap, pos: usize },
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::Buffered(reader) => reader.read(buf),
            Input::Mapped { map, pos } => {
                let remaining = &map[(*pos).min(map.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

struct StreamState {
    name: &'static str,
    input: Input,
    pending: Option<LogRecord>,
    previous_key_sid: Option<Vec<u8>>,
    exhausted: bool,
}

impl StreamState {
    fn buffered(name: &'static str, path: &Path) -> Result<Self, CursorError> {
        let file = File::open(path)?;
        Ok(Self {
            name,
            input: Input::Buffered(BufReader::new(file)),
            pending: None,
            previous_key_sid: None,
            exhausted: false,
        })
    }

    fn mapped(name: &'static str, path: &Path) -> Result<Self, CursorError> {
        let file = File::open(path)?;
        // SAFETY: the compacted file is immutable once renamed into place;
        // the datastore never rewrites it in place.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            name,
            input: Input::Mapped { map, pos: 0 },
            pending: None,
            previous_key_sid: None,
            exhausted: false,
        })
    }

    /// Ensures `pending` holds the next record, validating key order.
    fn refill(&mut self) -> Result<(), CursorError> {
        if self.pending.is_some() || self.exhausted {
            return Ok(());
        }

        match record::read_record(&mut self.input) {
            Ok(None) => {
                trace!(stream = self.name, "snapshot input exhausted");
                self.exhausted = true;
                Ok(())
            }
            Ok(Some(rec)) => {
                let Some(key_sid) = rec.key_sid() else {
                    return Err(CursorError::UnexpectedRecord { stream: self.name });
                };
                if let Some(prev) = &self.previous_key_sid
                    && key_sid < *prev
                {
                    return Err(CursorError::KeyOrderViolation { stream: self.name });
                }
                self.previous_key_sid = Some(key_sid);
                self.pending = Some(rec);
                Ok(())
            }
            Err(source) => Err(CursorError::Record {
                stream: self.name,
                source,
            }),
        }
    }

    fn peek_key_sid(&self) -> Option<Vec<u8>> {
        self.pending.as_ref().and_then(LogRecord::key_sid)
    }
}

// ------------------------------------------------------------------------------------------------
// SnapshotCursor
// ------------------------------------------------------------------------------------------------

/// Read-once merged view over the snapshot (and optional compacted) file.
pub struct SnapshotCursor {
    snapshot: StreamState,
    compacted: Option<StreamState>,
}

impl std::fmt::Debug for SnapshotCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCursor").finish_non_exhaustive()
    }
}

impl SnapshotCursor {
    /// Opens a cursor over a snapshot file alone.
    pub fn open(snapshot_file: &Path) -> Result<Self, CursorError> {
        Ok(Self {
            snapshot: StreamState::buffered("snapshot", snapshot_file)?,
            compacted: None,
        })
    }

    /// Opens a cursor merging a snapshot file with a compacted base file.
    pub fn open_with_compacted(
        snapshot_file: &Path,
        compacted_file: &Path,
    ) -> Result<Self, CursorError> {
        Ok(Self {
            snapshot: StreamState::buffered("snapshot", snapshot_file)?,
            compacted: Some(StreamState::mapped("compacted", compacted_file)?),
        })
    }

    /// Returns the next live entry, or `None` once both inputs are
    /// exhausted. Tombstones are filtered out.
    pub fn next(&mut self) -> Result<Option<SnapshotEntry>, CursorError> {
        loop {
            let Some(rec) = self.next_merged()? else {
                return Ok(None);
            };
            match rec {
                LogRecord::RemoveEntry { .. } => continue,
                LogRecord::NormalEntry {
                    storage,
                    key,
                    value,
                    write_version,
                } => {
                    return Ok(Some(SnapshotEntry {
                        storage,
                        key,
                        value,
                        write_version,
                        blob_ids: Vec::new(),
                    }));
                }
                LogRecord::NormalWithBlob {
                    storage,
                    key,
                    value,
                    write_version,
                    blob_ids,
                } => {
                    return Ok(Some(SnapshotEntry {
                        storage,
                        key,
                        value,
                        write_version,
                        blob_ids,
                    }));
                }
                _ => {
                    return Err(CursorError::UnexpectedRecord {
                        stream: "snapshot",
                    });
                }
            }
        }
    }

    /// Merge step: pick the lower key_sid; on a tie the snapshot entry
    /// wins and both entries are consumed.
    fn next_merged(&mut self) -> Result<Option<LogRecord>, CursorError> {
        self.snapshot.refill()?;
        if let Some(compacted) = &mut self.compacted {
            compacted.refill()?;
        }

        let snap_key = self.snapshot.peek_key_sid();
        let comp_key = self.compacted.as_ref().and_then(StreamState::peek_key_sid);

        match (snap_key, comp_key) {
            (None, None) => Ok(None),
            (Some(_), None) => Ok(self.snapshot.pending.take()),
            (None, Some(_)) => Ok(self
                .compacted
                .as_mut()
                .and_then(|stream| stream.pending.take())),
            (Some(snap), Some(comp)) => {
                if snap <= comp {
                    if snap == comp
                        && let Some(compacted) = &mut self.compacted
                    {
                        compacted.pending = None; // superseded by the snapshot entry
                    }
                    Ok(self.snapshot.pending.take())
                } else {
                    Ok(self
                        .compacted
                        .as_mut()
                        .and_then(|stream| stream.pending.take()))
                }
            }
        }
    }
}
