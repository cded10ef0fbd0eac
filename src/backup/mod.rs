//! # Backup & Restore
//!
//! Two layers:
//!
//! - **Local file-set operations** — [`restore`] and [`restore_entries`]
//!   copy a backup image into the log directory; `begin_backup` (on the
//!   datastore) enumerates the consistent on-disk file set after forcing
//!   a rotation, so only immutable rotated names plus the mutable
//!   metadata files appear in the set.
//! - **Protocol sessions** — [`BackupSessionManager`] implements the
//!   remote backup handshake: epoch-range validation, a UUID session
//!   token with an expiry extended by `keep_alive`, chunked object
//!   streaming, and an idempotent `end_backup`.
//!
//! Restore deliberately returns status codes instead of raising: callers
//! drive retry/abort decisions from `ok` / `err_not_found` /
//! `err_permission_error`.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fileio::FileOps;
use crate::record::EpochId;

// ------------------------------------------------------------------------------------------------
// Status codes & entries
// ------------------------------------------------------------------------------------------------

/// Result of a restore operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Restore completed.
    Ok,
    /// A listed source file was missing.
    ErrNotFound,
    /// A file could not be removed or copied.
    ErrPermissionError,
}

/// One file of a detailed backup image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetEntry {
    /// Where the file lives now (absolute, or relative to the backup
    /// root on restore).
    pub source_path: PathBuf,

    /// Destination relative to the log directory.
    pub destination_path: PathBuf,

    /// True for files that may still change (manifest, catalog); false
    /// for rotated, immutable files.
    pub is_mutable: bool,

    /// True when the file is already folded into a compacted file.
    pub is_detached: bool,
}

/// The file set of a standard backup.
#[derive(Debug, Clone)]
pub struct Backup {
    /// Absolute paths forming a consistent image.
    pub files: Vec<PathBuf>,
}

/// The file set of a detailed backup plus its session epoch.
#[derive(Debug, Clone)]
pub struct BackupDetail {
    /// Entries the caller copies at its own pace.
    pub entries: Vec<FileSetEntry>,

    /// Max durable epoch at enumeration time.
    pub epoch: EpochId,
}

// ------------------------------------------------------------------------------------------------
// Restore
// ------------------------------------------------------------------------------------------------

/// Restores a whole-directory backup: purges every non-directory entry of
/// the log directory, copies every file from `from`, and optionally
/// deletes the sources.
pub fn restore(log_dir: &Path, from: &Path, keep_backup: bool, ops: &dyn FileOps) -> RestoreStatus {
    debug!(from = %from.display(), keep_backup, "restore begin");

    if purge_log_dir(log_dir, ops) != RestoreStatus::Ok {
        return RestoreStatus::ErrPermissionError;
    }

    let sources = match ops.list_dir(from) {
        Ok(entries) => entries,
        Err(e) => {
            error!(from = %from.display(), error = %e, "failed to read backup directory");
            return RestoreStatus::ErrNotFound;
        }
    };

    for source in &sources {
        if ops.is_dir(source) {
            continue;
        }
        let Some(name) = source.file_name() else {
            continue;
        };
        if let Err(e) = ops.copy_file(source, &log_dir.join(name)) {
            error!(file = %source.display(), error = %e, "restore copy failed");
            return RestoreStatus::ErrPermissionError;
        }
    }

    if !keep_backup {
        for source in &sources {
            if ops.is_dir(source) {
                continue;
            }
            if let Err(e) = ops.remove_file(source) {
                warn!(file = %source.display(), error = %e, "failed to remove backup source");
            }
        }
    }

    info!(files = sources.len(), "restore finished");
    RestoreStatus::Ok
}

/// Restores from an entry list: each source is taken as given when
/// absolute, otherwise resolved against `from`; missing sources fail the
/// restore with `err_not_found`.
pub fn restore_entries(
    log_dir: &Path,
    from: &Path,
    entries: &[FileSetEntry],
    ops: &dyn FileOps,
) -> RestoreStatus {
    debug!(from = %from.display(), entries = entries.len(), "restore (entry list) begin");

    if purge_log_dir(log_dir, ops) != RestoreStatus::Ok {
        return RestoreStatus::ErrPermissionError;
    }

    for entry in entries {
        let source = if entry.source_path.is_absolute() {
            entry.source_path.clone()
        } else {
            from.join(&entry.source_path)
        };
        if !ops.exists(&source) || ops.is_dir(&source) {
            error!(file = %source.display(), "restore source not found");
            return RestoreStatus::ErrNotFound;
        }
        let destination = log_dir.join(&entry.destination_path);
        if let Some(parent) = destination.parent()
            && ops.create_dir_all(parent).is_err()
        {
            return RestoreStatus::ErrPermissionError;
        }
        if let Err(e) = ops.copy_file(&source, &destination) {
            error!(file = %source.display(), error = %e, "restore copy failed");
            return RestoreStatus::ErrPermissionError;
        }
    }
    RestoreStatus::Ok
}

/// Removes every non-directory entry of the log directory.
fn purge_log_dir(log_dir: &Path, ops: &dyn FileOps) -> RestoreStatus {
    let entries = match ops.list_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %log_dir.display(), error = %e, "failed to list log directory");
            return RestoreStatus::ErrPermissionError;
        }
    };
    for path in entries {
        if ops.is_dir(&path) {
            continue;
        }
        if let Err(e) = ops.remove_file(&path) {
            error!(file = %path.display(), error = %e, "failed to purge log directory");
            return RestoreStatus::ErrPermissionError;
        }
    }
    RestoreStatus::Ok
}

// ------------------------------------------------------------------------------------------------
// Protocol sessions
// ------------------------------------------------------------------------------------------------

/// Errors raised by the backup session protocol.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Underlying I/O error while streaming object bytes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested epoch range is not serveable.
    #[error("Invalid backup epoch range: {0}")]
    InvalidRange(String),

    /// Session token is unknown or has expired.
    #[error("Unknown or expired backup session: {0}")]
    UnknownSession(String),

    /// An object id outside the session's object list.
    #[error("Unknown backup object: {0}")]
    UnknownObject(String),
}

/// One object served by a backup session.
#[derive(Debug, Clone)]
pub struct BackupObject {
    /// Stable object id (its destination-relative name).
    pub id: String,

    /// Absolute path of the source file.
    pub path: PathBuf,
}

/// One streamed chunk of a backup object.
#[derive(Debug, Clone)]
pub struct BackupChunk {
    /// Object the chunk belongs to.
    pub object_id: String,

    /// Destination-relative path of the object.
    pub path: String,

    /// True for the first chunk of the object.
    pub is_first: bool,

    /// True for the last chunk of the object.
    pub is_last: bool,

    /// Byte offset of this chunk within the object.
    pub offset: u64,

    /// Total object size in bytes.
    pub total_size: u64,

    /// Chunk payload.
    pub data: Vec<u8>,
}

/// Epoch bounds used to validate `begin_backup` requests.
#[derive(Debug, Clone, Copy)]
pub struct EpochBounds {
    /// Epoch of the compacted snapshot base.
    pub snapshot_epoch: EpochId,

    /// Current (switched) epoch.
    pub current_epoch: EpochId,

    /// Durable epoch at boot.
    pub boot_durable_epoch: EpochId,
}

/// A live backup session.
#[derive(Debug)]
struct SessionState {
    expire_at: Instant,
    objects: Vec<BackupObject>,
}

/// Session info returned by `begin_backup`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The session token (UUID).
    pub token: String,

    /// When the session expires unless kept alive.
    pub expire_at: Instant,

    /// Objects available for download.
    pub objects: Vec<BackupObject>,
}

/// Manages remote backup sessions: tokens, expiry, object streaming.
#[derive(Debug)]
pub struct BackupSessionManager {
    sessions: Mutex<HashMap<String, SessionState>>,
    session_ttl: Duration,
    chunk_size: usize,
}

/// Default session time-to-live without keep-alives.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Default object chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

impl Default for BackupSessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL, DEFAULT_CHUNK_SIZE)
    }
}

impl BackupSessionManager {
    /// Creates a manager with the given session TTL and chunk size.
    pub fn new(session_ttl: Duration, chunk_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Validates the epoch range and opens a session over `objects`.
    ///
    /// Validation: `begin < end`, `begin > snapshot_epoch`,
    /// `end ≤ current_epoch`, `end > boot_durable_epoch`.
    pub fn begin_backup(
        &self,
        begin_epoch: EpochId,
        end_epoch: EpochId,
        bounds: EpochBounds,
        objects: Vec<BackupObject>,
    ) -> Result<SessionInfo, BackupError> {
        if begin_epoch >= end_epoch {
            return Err(BackupError::InvalidRange(format!(
                "begin {begin_epoch} must be below end {end_epoch}"
            )));
        }
        if begin_epoch <= bounds.snapshot_epoch {
            return Err(BackupError::InvalidRange(format!(
                "begin {begin_epoch} must be above snapshot epoch {}",
                bounds.snapshot_epoch
            )));
        }
        if end_epoch > bounds.current_epoch {
            return Err(BackupError::InvalidRange(format!(
                "end {end_epoch} must not exceed current epoch {}",
                bounds.current_epoch
            )));
        }
        if end_epoch <= bounds.boot_durable_epoch {
            return Err(BackupError::InvalidRange(format!(
                "end {end_epoch} must be above boot durable epoch {}",
                bounds.boot_durable_epoch
            )));
        }

        let token = Uuid::new_v4().to_string();
        let expire_at = Instant::now() + self.session_ttl;
        self.lock().insert(
            token.clone(),
            SessionState {
                expire_at,
                objects: objects.clone(),
            },
        );
        info!(token = %token, objects = objects.len(), "backup session opened");
        Ok(SessionInfo {
            token,
            expire_at,
            objects,
        })
    }

    /// Extends the session expiry. Fails for unknown or expired tokens.
    pub fn keep_alive(&self, token: &str) -> Result<Instant, BackupError> {
        let mut sessions = self.lock();
        Self::drop_expired(&mut sessions);
        match sessions.get_mut(token) {
            Some(session) => {
                session.expire_at = Instant::now() + self.session_ttl;
                Ok(session.expire_at)
            }
            None => Err(BackupError::UnknownSession(token.to_string())),
        }
    }

    /// Streams the requested objects as chunks.
    pub fn get_object(
        &self,
        token: &str,
        object_ids: &[String],
        ops: &dyn FileOps,
    ) -> Result<Vec<BackupChunk>, BackupError> {
        let objects: Vec<BackupObject> = {
            let mut sessions = self.lock();
            Self::drop_expired(&mut sessions);
            let session = sessions
                .get(token)
                .ok_or_else(|| BackupError::UnknownSession(token.to_string()))?;

            let mut selected = Vec::with_capacity(object_ids.len());
            for id in object_ids {
                let object = session
                    .objects
                    .iter()
                    .find(|o| &o.id == id)
                    .ok_or_else(|| BackupError::UnknownObject(id.clone()))?;
                selected.push(object.clone());
            }
            selected
        };

        let mut chunks = Vec::new();
        for object in objects {
            self.chunk_object(&object, ops, &mut chunks)?;
        }
        Ok(chunks)
    }

    /// Ends the session. Unknown tokens are an idempotent no-op.
    pub fn end_backup(&self, token: &str) {
        if self.lock().remove(token).is_some() {
            info!(token, "backup session ended");
        } else {
            debug!(token, "end_backup for unknown session ignored");
        }
    }

    /// Number of live (unexpired) sessions.
    pub fn live_sessions(&self) -> usize {
        let mut sessions = self.lock();
        Self::drop_expired(&mut sessions);
        sessions.len()
    }

    fn chunk_object(
        &self,
        object: &BackupObject,
        ops: &dyn FileOps,
        chunks: &mut Vec<BackupChunk>,
    ) -> Result<(), BackupError> {
        let total_size = ops.file_len(&object.path)?;
        let mut file = ops.open_read(&object.path)?;

        // Empty objects still produce one (first and last) empty chunk so
        // receivers create the file.
        if total_size == 0 {
            chunks.push(BackupChunk {
                object_id: object.id.clone(),
                path: object.id.clone(),
                is_first: true,
                is_last: true,
                offset: 0,
                total_size: 0,
                data: Vec::new(),
            });
            return Ok(());
        }

        let mut offset = 0u64;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(BackupError::Io(e)),
                }
            }
            if filled == 0 {
                break;
            }
            let is_last = offset + filled as u64 >= total_size;
            chunks.push(BackupChunk {
                object_id: object.id.clone(),
                path: object.id.clone(),
                is_first: offset == 0,
                is_last,
                offset,
                total_size,
                data: buf[..filled].to_vec(),
            });
            offset += filled as u64;
            if is_last {
                break;
            }
        }
        Ok(())
    }

    fn drop_expired(sessions: &mut HashMap<String, SessionState>) {
        let now = Instant::now();
        sessions.retain(|token, session| {
            let live = session.expire_at > now;
            if !live {
                warn!(token = %token, "backup session expired");
            }
            live
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
