//! # Log Channel Writer
//!
//! A channel is a single-writer append stream bound to one active WAL
//! file. Writers batch entries between `begin_session` and `end_session`;
//! the channel brackets each batch with epoch markers so recovery can tell
//! complete sessions from torn ones:
//!
//! ```text
//! marker_begin(e)
//!   normal_entry / normal_with_blob / remove_entry / storage events …
//! marker_end(e)
//! ```
//!
//! `begin_session` captures the datastore's current switched epoch `e`;
//! every entry of the session is stamped with write version
//! ⟨e, caller-supplied minor⟩. `end_session` publishes the bytes via flush
//! — **not** fsync: durability is an epoch property decided by the epoch
//! coordinator, not a per-entry property.
//!
//! An I/O failure inside a session fails the session and appends
//! `marker_invalidated_begin(e)`, marking the enclosed region
//! unrecoverable.
//!
//! ## Rotation
//!
//! [`LogChannel::rotate`] atomically renames the active `pwal_<id:04x>`
//! to `pwal_<id:04x>.<unix_millis>.<seq>` and starts a fresh active file.
//! Rotation waits until no session is open; sessions never wait on
//! rotation beyond that handoff.


use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::epoch::{ChannelMarks, EpochCoordinator, EpochError, unix_millis};
use crate::fileio::FileOps;
use crate::record::{self, BlobId, EpochId, LogRecord, RecordError, StorageId, WriteVersion};

// ------------------------------------------------------------------------------------------------
// Naming
// ------------------------------------------------------------------------------------------------

/// Prefix of every channel WAL file.
pub const PWAL_PREFIX: &str = "pwal_";

/// Active WAL file name for a channel id.
pub fn channel_file_name(channel_id: u64) -> String {
    format!("{PWAL_PREFIX}{channel_id:04x}")
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Underlying I/O error. The active session (if any) has been
    /// invalidated.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing failure.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Failure while advancing the durability chain.
    #[error("Epoch error: {0}")]
    Epoch(#[from] EpochError),

    /// `begin_session` while a session is already open on this channel.
    #[error("Channel {0} already has an open session")]
    SessionActive(u64),

    /// New sessions are refused after shutdown.
    #[error("Datastore is shutting down")]
    ShuttingDown,

    /// The caller-supplied minor version went backwards within a session.
    #[error("Write version minor must be monotonic within a session: {previous} then {supplied}")]
    NonMonotonicMinor {
        /// Last accepted minor.
        previous: u64,
        /// Rejected minor.
        supplied: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// LogChannel
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct ChannelInner {
    file: File,
    session_open: bool,
    rotation_seq: u64,
}

/// One rotated, immutable WAL file produced by [`LogChannel::rotate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedFile {
    /// Full path of the rotated file.
    pub path: PathBuf,

    /// File name relative to the log directory.
    pub name: String,
}

/// A per-channel append-only WAL writer.
#[derive(Debug)]
pub struct LogChannel {
    id: u64,
    log_dir: PathBuf,
    coordinator: Arc<EpochCoordinator>,
    marks: Arc<ChannelMarks>,
    ops: Arc<dyn FileOps>,
    shutdown: Arc<AtomicBool>,
    inner: Mutex<ChannelInner>,
    cv_idle: Condvar,
}

impl LogChannel {
    /// Opens (or creates) the channel's active WAL file and registers its
    /// watermarks with the coordinator.
    pub fn new(
        id: u64,
        log_dir: impl Into<PathBuf>,
        coordinator: Arc<EpochCoordinator>,
        ops: Arc<dyn FileOps>,
    ) -> Result<Self, ChannelError> {
        Self::with_shutdown_flag(id, log_dir, coordinator, ops, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`new`](Self::new), sharing the owner's shutdown flag so new
    /// sessions are refused once shutdown begins.
    pub fn with_shutdown_flag(
        id: u64,
        log_dir: impl Into<PathBuf>,
        coordinator: Arc<EpochCoordinator>,
        ops: Arc<dyn FileOps>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ChannelError> {
        let log_dir = log_dir.into();
        let file = ops.open_append(&log_dir.join(channel_file_name(id)))?;
        let marks = Arc::new(ChannelMarks::new());
        coordinator.register_channel(Arc::clone(&marks));

        info!(channel = id, "log channel opened");
        Ok(Self {
            id,
            log_dir,
            coordinator,
            marks,
            ops,
            shutdown,
            inner: Mutex::new(ChannelInner {
                file,
                session_open: false,
                rotation_seq: 0,
            }),
            cv_idle: Condvar::new(),
        })
    }

    /// Channel id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path of the active WAL file.
    pub fn active_path(&self) -> PathBuf {
        self.log_dir.join(channel_file_name(self.id))
    }

    /// Epoch of the most recently finished session.
    pub fn finished_epoch(&self) -> EpochId {
        self.marks.finished()
    }

    // --------------------------------------------------------------------------------------------
    // Sessions
    // --------------------------------------------------------------------------------------------

    /// Opens a write session: captures the current switched epoch and
    /// appends `marker_begin`.
    pub fn begin_session(&self) -> Result<LogSession<'_>, ChannelError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ChannelError::ShuttingDown);
        }
        let mut inner = self.lock();
        if inner.session_open {
            return Err(ChannelError::SessionActive(self.id));
        }

        // Capture the switched epoch; retry if a switch lands in between
        // so the published watermark never lags the marker we write.
        let epoch = loop {
            let epoch = self.coordinator.switched_epoch();
            self.marks.begin(epoch);
            if self.coordinator.switched_epoch() == epoch {
                break epoch;
            }
        };

        if let Err(e) = record::write_record(&mut inner.file, &LogRecord::MarkerBegin { epoch }) {
            self.fail_session(&mut inner, epoch);
            return Err(e.into());
        }
        inner.session_open = true;
        trace!(channel = self.id, epoch, "session begun");

        Ok(LogSession {
            channel: self,
            epoch,
            last_minor: None,
            finished: false,
        })
    }

    fn append(&self, epoch: EpochId, rec: &LogRecord) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if let Err(e) = record::write_record(&mut inner.file, rec) {
            error!(channel = self.id, epoch, error = %e, "append failed, invalidating session");
            self.fail_session(&mut inner, epoch);
            return Err(e.into());
        }
        Ok(())
    }

    fn end_session(&self, epoch: EpochId) -> Result<(), ChannelError> {
        {
            let mut inner = self.lock();
            if let Err(e) = record::write_record(&mut inner.file, &LogRecord::MarkerEnd { epoch }) {
                error!(channel = self.id, epoch, error = %e, "end marker failed, invalidating session");
                self.fail_session(&mut inner, epoch);
                return Err(e.into());
            }
            // Publish bytes; durability is the epoch coordinator's job.
            if let Err(e) = inner.file.flush() {
                self.fail_session(&mut inner, epoch);
                return Err(e.into());
            }
            inner.session_open = false;
            self.marks.end(epoch);
        }
        self.cv_idle.notify_all();
        trace!(channel = self.id, epoch, "session ended");

        self.coordinator.update_min_epoch_id(false)?;
        Ok(())
    }

    /// Invalidates the current session region and releases the epoch pin.
    fn fail_session(&self, inner: &mut MutexGuard<'_, ChannelInner>, epoch: EpochId) {
        if let Err(e) = record::write_record(
            &mut inner.file,
            &LogRecord::MarkerInvalidatedBegin { epoch },
        ) {
            warn!(channel = self.id, epoch, error = %e,
                  "failed to write invalidation marker");
        }
        let _ = inner.file.flush();
        inner.session_open = false;
        self.marks.end(epoch);
        self.cv_idle.notify_all();
    }

    // --------------------------------------------------------------------------------------------
    // Rotation
    // --------------------------------------------------------------------------------------------

    /// Rotates the active file once no session is open. Returns `None`
    /// when the active file holds no bytes (nothing to rotate).
    pub fn rotate(&self) -> Result<Option<RotatedFile>, ChannelError> {
        let mut inner = self.lock();
        while inner.session_open {
            inner = match self.cv_idle.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        self.ops.flush_and_sync(&mut inner.file)?;

        let active = self.active_path();
        if self.ops.file_len(&active)? == 0 {
            debug!(channel = self.id, "active file empty, rotation skipped");
            return Ok(None);
        }

        inner.rotation_seq += 1;
        let name = format!(
            "{}.{}.{}",
            channel_file_name(self.id),
            unix_millis(),
            inner.rotation_seq
        );
        let rotated_path = self.log_dir.join(&name);
        self.ops.rename(&active, &rotated_path)?;
        inner.file = self.ops.open_append(&active)?;

        info!(channel = self.id, rotated = %rotated_path.display(), "wal file rotated");
        Ok(Some(RotatedFile {
            path: rotated_path,
            name,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LogSession
// ------------------------------------------------------------------------------------------------

/// An open write session on a channel.
///
/// Entries are stamped with write version ⟨session epoch, minor⟩; the
/// caller supplies a minor that must be unique and monotonic within the
/// session. Dropping the session without [`end`](Self::end) invalidates
/// it.
#[derive(Debug)]
pub struct LogSession<'a> {
    channel: &'a LogChannel,
    epoch: EpochId,
    last_minor: Option<u64>,
    finished: bool,
}

impl LogSession<'_> {
    /// The epoch captured at `begin_session`.
    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    /// Appends a key/value write.
    pub fn add_entry(
        &mut self,
        storage: StorageId,
        key: &[u8],
        value: &[u8],
        minor: u64,
    ) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::NormalEntry {
            storage,
            key: key.to_vec(),
            value: value.to_vec(),
            write_version,
        })
    }

    /// Appends a key/value write referencing out-of-line BLOBs.
    pub fn add_entry_with_blobs(
        &mut self,
        storage: StorageId,
        key: &[u8],
        value: &[u8],
        minor: u64,
        blob_ids: Vec<BlobId>,
    ) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::NormalWithBlob {
            storage,
            key: key.to_vec(),
            value: value.to_vec(),
            write_version,
            blob_ids,
        })
    }

    /// Appends a tombstone for the key.
    pub fn remove_entry(
        &mut self,
        storage: StorageId,
        key: &[u8],
        minor: u64,
    ) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::RemoveEntry {
            storage,
            key: key.to_vec(),
            write_version,
        })
    }

    /// Erases the storage's contents at or below the stamped version.
    pub fn clear_storage(&mut self, storage: StorageId, minor: u64) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::ClearStorage {
            storage,
            write_version,
        })
    }

    /// Registers the storage id.
    pub fn add_storage(&mut self, storage: StorageId, minor: u64) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::AddStorage {
            storage,
            write_version,
        })
    }

    /// Removes the storage and its contents at or below the stamped
    /// version.
    pub fn remove_storage(&mut self, storage: StorageId, minor: u64) -> Result<(), ChannelError> {
        let write_version = self.stamp(minor)?;
        self.append(LogRecord::RemoveStorage {
            storage,
            write_version,
        })
    }

    /// Ends the session: appends `marker_end`, publishes via flush, and
    /// lets the durability chain advance.
    pub fn end(mut self) -> Result<(), ChannelError> {
        self.finished = true;
        self.channel.end_session(self.epoch)
    }

    fn stamp(&mut self, minor: u64) -> Result<WriteVersion, ChannelError> {
        if let Some(previous) = self.last_minor
            && minor <= previous
        {
            return Err(ChannelError::NonMonotonicMinor {
                previous,
                supplied: minor,
            });
        }
        self.last_minor = Some(minor);
        Ok(WriteVersion::new(self.epoch, minor))
    }

    fn append(&mut self, rec: LogRecord) -> Result<(), ChannelError> {
        match self.channel.append(self.epoch, &rec) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The channel already invalidated the region.
                self.finished = true;
                Err(e)
            }
        }
    }
}

impl Drop for LogSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                channel = self.channel.id,
                epoch = self.epoch,
                "session dropped without end, invalidating"
            );
            let mut inner = self.channel.lock();
            self.channel.fail_session(&mut inner, self.epoch);
        }
    }
}
