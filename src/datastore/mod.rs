//! # Datastore
//!
//! The root owning entity of the persistence core. A [`Datastore`] owns
//! the log directory exclusively (enforced by the manifest file lock),
//! aggregates the log channels, the epoch coordinator, the compaction
//! catalog, the WAL history, and the BLOB subsystem, and walks the
//! `not_ready → ready → shutdown` lifecycle:
//!
//! - [`Datastore::open`] validates and migrates the manifest, repairs the
//!   WAL history and catalog from their backups, and finds the last
//!   durable epoch. Channels and callbacks are registered in this phase.
//! - [`Datastore::ready`] runs recovery: the bounded-parallel WAL scan
//!   materializes `data/snapshot`, and the datastore starts accepting
//!   sessions, epoch switches, compaction, and backups.
//! - [`Datastore::shutdown`] refuses new sessions, lets in-flight
//!   sessions finish, and joins the background GC workers. It returns a
//!   handle the caller can wait on.
//!
//! Writes never block on compaction; compaction waits only for the
//! rotation barrier. At most one compaction/rotation runs at a time.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backup::{
    Backup, BackupDetail, BackupError, BackupObject, BackupSessionManager, EpochBounds,
    FileSetEntry, RestoreStatus, SessionInfo,
};
use crate::blob::pool::BlobPool;
use crate::blob::{BlobFileGarbageCollector, BlobFileResolver, GcError};
use crate::catalog::{CATALOG_BACKUP_NAME, CATALOG_FILE_NAME, CatalogError, CompactionCatalog};
use crate::channel::{ChannelError, LogChannel, PWAL_PREFIX};
use crate::compaction::{self, COMPACTED_FILE_NAME, CompactionError};
use crate::epoch::{
    EPOCH_FILE_NAME, EpochCoordinator, EpochError, PersistentCallback, search_max_durable_epoch,
};
use crate::fileio::{FileOps, StdFileOps};
use crate::history::{HISTORY_FILE_NAME, HistoryError, WalHistory};
use crate::manifest::{self, MANIFEST_FILE_NAME, ManifestError};
use crate::record::{BlobId, EpochId, WriteVersion};
use crate::scanner::{self, RecoveryError};
use crate::snapshot::{CursorError, SnapshotCursor};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by datastore operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest validation, migration, or locking failure.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Compaction catalog failure.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Epoch coordination failure.
    #[error("Epoch error: {0}")]
    Epoch(#[from] EpochError),

    /// Log channel failure.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Recovery failure; the datastore refuses to become ready.
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// WAL history failure.
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// Compaction failure; the catalog keeps its prior state.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// BLOB garbage collector misuse.
    #[error("GC error: {0}")]
    Gc(#[from] GcError),

    /// Backup protocol failure.
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Snapshot cursor failure.
    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// The operation requires `ready()` first.
    #[error("Operation {0} requires the datastore to be ready")]
    NotReady(&'static str),

    /// The operation is only allowed before `ready()`.
    #[error("Operation {0} is only allowed before ready()")]
    AlreadyReady(&'static str),

    /// The datastore is shutting down.
    #[error("Datastore is shutting down")]
    ShuttingDown,

    /// The available boundary version must be monotonic.
    #[error("Available boundary version must not decrease")]
    BoundaryNotMonotonic,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Datastore construction parameters.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Directory holding WAL files, metadata, and BLOBs.
    pub log_dir: PathBuf,

    /// Worker-pool bound for the recovery scan.
    pub recover_max_parallelism: usize,
}

impl DatastoreConfig {
    /// Config with the default recovery parallelism.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            recover_max_parallelism: 4,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lifecycle state
// ------------------------------------------------------------------------------------------------

const STATE_NOT_READY: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// Handle returned by [`Datastore::shutdown`]; completes once new
/// sessions are refused and background workers are joined.
#[derive(Debug)]
pub struct ShutdownHandle {
    thread: Option<JoinHandle<()>>,
}

impl ShutdownHandle {
    /// Blocks until the shutdown has completed.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Datastore
// ------------------------------------------------------------------------------------------------

/// The persistence core's root object. See the module documentation for
/// the lifecycle.
#[derive(Debug)]
pub struct Datastore {
    config: DatastoreConfig,
    ops: Arc<dyn FileOps>,

    /// Exclusive single-writer lock; held for the datastore lifetime.
    _manifest_lock: File,

    coordinator: Arc<EpochCoordinator>,
    channels: Mutex<Vec<Arc<LogChannel>>>,
    catalog: Mutex<CompactionCatalog>,
    history: WalHistory,

    resolver: Arc<BlobFileResolver>,
    next_blob_id: Arc<AtomicU64>,
    persistent_blob_ids: Arc<Mutex<BTreeSet<BlobId>>>,
    garbage_collector: Mutex<Option<Arc<BlobFileGarbageCollector>>>,

    backup_sessions: BackupSessionManager,

    /// Tracked file set used to enumerate backups.
    files: Mutex<BTreeSet<PathBuf>>,

    state: AtomicU8,
    shutdown_flag: Arc<AtomicBool>,

    /// At most one rotation/compaction in progress.
    rotate_mutex: Mutex<()>,

    /// Oldest readable version; anything strictly older may be deleted.
    boundary: Mutex<WriteVersion>,

    snapshot_path: Mutex<Option<PathBuf>>,
    boot_durable_epoch: EpochId,
}

impl Datastore {
    /// Opens (or creates) a datastore over the configured log directory.
    ///
    /// Validates/migrates the manifest, repairs catalog and history from
    /// their backups, locks the directory, and seeds the epoch
    /// coordinator from the last durable epoch.
    pub fn open(config: DatastoreConfig) -> Result<Self, DatastoreError> {
        let ops: Arc<dyn FileOps> = Arc::new(StdFileOps);
        Self::open_with_ops(config, ops)
    }

    /// Like [`open`](Self::open) with an injectable filesystem backend.
    pub fn open_with_ops(
        config: DatastoreConfig,
        ops: Arc<dyn FileOps>,
    ) -> Result<Self, DatastoreError> {
        let log_dir = &config.log_dir;
        ops.create_dir_all(log_dir)?;

        manifest::create_initial(log_dir, &*ops)?;
        manifest::check_and_migrate(log_dir, &*ops)?;
        let manifest_lock = manifest::acquire_lock(log_dir)?;

        let history = WalHistory::new(log_dir.clone(), Arc::clone(&ops));
        history.check_and_recover()?;

        let catalog = CompactionCatalog::from_catalog_file(log_dir, &*ops)?;
        let boot_durable_epoch = search_max_durable_epoch(log_dir, &*ops)?;
        let coordinator = Arc::new(EpochCoordinator::new(
            log_dir.clone(),
            boot_durable_epoch,
            Arc::clone(&ops),
        )?);

        let resolver = Arc::new(BlobFileResolver::new(log_dir));

        let mut files = BTreeSet::new();
        for path in ops.list_dir(log_dir)? {
            if !ops.is_dir(&path) {
                files.insert(path);
            }
        }

        info!(
            log_dir = %log_dir.display(),
            boot_durable_epoch,
            "datastore opened"
        );

        Ok(Self {
            config,
            ops,
            _manifest_lock: manifest_lock,
            coordinator,
            channels: Mutex::new(Vec::new()),
            catalog: Mutex::new(catalog),
            history,
            resolver,
            next_blob_id: Arc::new(AtomicU64::new(0)),
            persistent_blob_ids: Arc::new(Mutex::new(BTreeSet::new())),
            garbage_collector: Mutex::new(None),
            backup_sessions: BackupSessionManager::default(),
            files: Mutex::new(files),
            state: AtomicU8::new(STATE_NOT_READY),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            rotate_mutex: Mutex::new(()),
            boundary: Mutex::new(WriteVersion::default()),
            snapshot_path: Mutex::new(None),
            boot_durable_epoch,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Runs recovery and transitions to the operational state.
    pub fn ready(&self) -> Result<(), DatastoreError> {
        self.check_before_ready("ready")?;

        let image = {
            let catalog = lock(&self.catalog);
            scanner::build_snapshot(
                &self.config.log_dir,
                &catalog,
                self.coordinator.durable_epoch(),
                self.config.recover_max_parallelism,
                &*self.ops,
            )?
        };

        self.next_blob_id.store(image.max_blob_id, Ordering::SeqCst);
        *lock(&self.snapshot_path) = Some(image.snapshot_path);
        // Immediately after ready, the boundary sits at the last durable
        // epoch.
        *lock(&self.boundary) = WriteVersion::new(self.coordinator.durable_epoch(), 0);
        self.state.store(STATE_READY, Ordering::SeqCst);

        info!(entries = image.entry_count, "datastore ready");
        Ok(())
    }

    /// Prohibits new sessions and joins background workers. In-flight
    /// sessions finish normally.
    pub fn shutdown(&self) -> ShutdownHandle {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.state.store(STATE_SHUTDOWN, Ordering::SeqCst);

        let collector = lock(&self.garbage_collector).take();
        let thread = std::thread::Builder::new()
            .name("datastore-shutdown".into())
            .spawn(move || {
                if let Some(collector) = collector {
                    collector.shutdown();
                }
            })
            .ok();

        info!("datastore shutdown initiated");
        ShutdownHandle { thread }
    }

    fn check_after_ready(&self, op: &'static str) -> Result<(), DatastoreError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_READY => Ok(()),
            STATE_SHUTDOWN => Err(DatastoreError::ShuttingDown),
            _ => {
                warn!(op, "called before ready()");
                Err(DatastoreError::NotReady(op))
            }
        }
    }

    fn check_before_ready(&self, op: &'static str) -> Result<(), DatastoreError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_NOT_READY => Ok(()),
            STATE_SHUTDOWN => Err(DatastoreError::ShuttingDown),
            _ => {
                warn!(op, "called after ready()");
                Err(DatastoreError::AlreadyReady(op))
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Channels & epochs
    // --------------------------------------------------------------------------------------------

    /// Creates a log channel bound to its own active WAL file.
    ///
    /// Channels are created before `ready()`; their ids are dense from 0.
    pub fn create_channel(&self) -> Result<Arc<LogChannel>, DatastoreError> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(DatastoreError::ShuttingDown);
        }
        let mut channels = lock(&self.channels);
        let id = channels.len() as u64;
        let channel = Arc::new(LogChannel::with_shutdown_flag(
            id,
            self.config.log_dir.clone(),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.ops),
            Arc::clone(&self.shutdown_flag),
        )?);
        channels.push(Arc::clone(&channel));
        self.add_file(channel.active_path());
        Ok(channel)
    }

    /// The largest epoch successfully persisted.
    pub fn last_epoch(&self) -> EpochId {
        self.coordinator.durable_epoch()
    }

    /// Transitions to a new (strictly greater) epoch.
    pub fn switch_epoch(&self, epoch: EpochId) -> Result<(), DatastoreError> {
        self.check_after_ready("switch_epoch")?;
        self.coordinator.switch_epoch(epoch)?;
        Ok(())
    }

    /// Registers the persistent callback. Pre-ready only.
    pub fn add_persistent_callback(
        &self,
        callback: PersistentCallback,
    ) -> Result<(), DatastoreError> {
        self.check_before_ready("add_persistent_callback")?;
        self.coordinator.set_persistent_callback(callback);
        Ok(())
    }

    /// The epoch coordinator (watermark accessors, waiting).
    pub fn epoch_coordinator(&self) -> &Arc<EpochCoordinator> {
        &self.coordinator
    }

    // --------------------------------------------------------------------------------------------
    // Snapshot access
    // --------------------------------------------------------------------------------------------

    /// Opens a cursor over the recovery image (snapshot merged with the
    /// compacted base, if any).
    pub fn snapshot(&self) -> Result<SnapshotCursor, DatastoreError> {
        self.check_after_ready("snapshot")?;
        let snapshot_path = lock(&self.snapshot_path)
            .clone()
            .ok_or(DatastoreError::NotReady("snapshot"))?;

        let compacted_path = self.config.log_dir.join(COMPACTED_FILE_NAME);
        let cursor = if self.ops.exists(&compacted_path) {
            SnapshotCursor::open_with_compacted(&snapshot_path, &compacted_path)?
        } else {
            SnapshotCursor::open(&snapshot_path)?
        };
        Ok(cursor)
    }

    // --------------------------------------------------------------------------------------------
    // Rotation & compaction
    // --------------------------------------------------------------------------------------------

    /// Rotates every channel and the epoch file, appending a WAL-history
    /// record at the branch point. Returns the rotated WAL file names.
    pub fn rotate_log_files(&self) -> Result<Vec<PathBuf>, DatastoreError> {
        let _guard = lock(&self.rotate_mutex);
        self.rotate_log_files_locked()
    }

    fn rotate_log_files_locked(&self) -> Result<Vec<PathBuf>, DatastoreError> {
        let channels: Vec<Arc<LogChannel>> = lock(&self.channels).clone();
        let mut rotated_paths = Vec::new();
        for channel in &channels {
            if let Some(rotated) = channel.rotate()? {
                self.add_file(rotated.path.clone());
                rotated_paths.push(rotated.path);
            }
        }
        let rotated_epoch = self.coordinator.rotate_epoch_file()?;
        self.add_file(rotated_epoch);

        self.history.append(self.coordinator.durable_epoch())?;
        self.add_file(self.history.file_path());

        debug!(rotated = rotated_paths.len(), "log rotation complete");
        Ok(rotated_paths)
    }

    /// Performs one online compaction round and schedules BLOB garbage
    /// collection over the result.
    pub fn compact_with_online(&self) -> Result<(), DatastoreError> {
        self.check_after_ready("compact_with_online")?;
        let _guard = lock(&self.rotate_mutex);

        // Rotation barrier: all channels move their sessions to immutable
        // rotated files before selection.
        self.rotate_log_files_locked()?;
        let ceiling = self.coordinator.durable_epoch();

        let outcome = {
            let mut catalog = lock(&self.catalog);
            compaction::compact_rotated_files(&self.config.log_dir, &mut catalog, ceiling, &*self.ops)?
        };
        let Some(outcome) = outcome else {
            debug!("compaction had no input");
            return Ok(());
        };
        self.add_file(outcome.compacted_path.clone());

        // Schedule BLOB GC: candidates come from the disk scan bounded by
        // the ids observed in the merge inputs; exempt ids come from the
        // snapshot + fresh compacted image and the pending persistent set.
        let collector = Arc::new(BlobFileGarbageCollector::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.ops),
        ));
        {
            let mut slot = lock(&self.garbage_collector);
            if let Some(previous) = slot.take() {
                previous.shutdown();
            }
            *slot = Some(Arc::clone(&collector));
        }

        collector.scan_blob_files(outcome.max_blob_id_seen)?;
        for id in lock(&self.persistent_blob_ids).iter() {
            collector.add_gc_exempt_blob_id(*id)?;
        }
        let snapshot_path = lock(&self.snapshot_path).clone();
        match snapshot_path {
            Some(snapshot_path) => {
                collector.scan_snapshot(snapshot_path, Some(outcome.compacted_path.clone()))?;
            }
            None => {
                // No recovery snapshot: the compacted image alone defines
                // the live references.
                collector.scan_snapshot(outcome.compacted_path.clone(), None)?;
            }
        }
        collector.finalize_scan_and_cleanup();

        info!(
            entries = outcome.entry_count,
            max_epoch = outcome.max_epoch,
            "online compaction scheduled gc"
        );
        Ok(())
    }

    /// Blocks until the current GC round (if any) has finished. Test
    /// observability hook.
    pub fn wait_for_blob_gc(&self) {
        let collector = lock(&self.garbage_collector).clone();
        if let Some(collector) = collector {
            collector.wait_for_all_threads();
        }
    }

    // --------------------------------------------------------------------------------------------
    // BLOB lifecycle
    // --------------------------------------------------------------------------------------------

    /// Acquires a new empty BLOB pool for temporary registration.
    pub fn acquire_blob_pool(&self) -> BlobPool {
        BlobPool::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.ops),
            Arc::clone(&self.next_blob_id),
            Arc::clone(&self.persistent_blob_ids),
        )
    }

    /// Resolves the file path of a BLOB id.
    pub fn blob_file_path(&self, id: BlobId) -> PathBuf {
        self.resolver.resolve_path(id)
    }

    /// Marks BLOB ids as persistently referenced (logged in a durable
    /// entry).
    pub fn add_persistent_blob_ids(&self, ids: &[BlobId]) {
        let mut set = lock(&self.persistent_blob_ids);
        for id in ids {
            set.insert(*id);
        }
    }

    /// Removes and returns the subset of `ids` currently tracked as
    /// persistent.
    pub fn check_and_remove_persistent_blob_ids(&self, ids: &[BlobId]) -> Vec<BlobId> {
        let mut set = lock(&self.persistent_blob_ids);
        ids.iter().copied().filter(|id| set.remove(id)).collect()
    }

    // --------------------------------------------------------------------------------------------
    // Boundary version
    // --------------------------------------------------------------------------------------------

    /// Raises the available boundary version (monotonic).
    pub fn switch_available_boundary_version(
        &self,
        version: WriteVersion,
    ) -> Result<(), DatastoreError> {
        self.check_after_ready("switch_available_boundary_version")?;
        let mut boundary = lock(&self.boundary);
        if version < *boundary {
            return Err(DatastoreError::BoundaryNotMonotonic);
        }
        *boundary = version;
        Ok(())
    }

    /// The oldest readable version.
    pub fn available_boundary_version(&self) -> WriteVersion {
        *lock(&self.boundary)
    }

    // --------------------------------------------------------------------------------------------
    // Backup & restore
    // --------------------------------------------------------------------------------------------

    /// Standard backup: rotates, then returns the file paths forming a
    /// consistent image. Active WAL and epoch files are never listed.
    pub fn begin_backup(&self) -> Result<Backup, DatastoreError> {
        let detail = self.begin_backup_detailed()?;
        Ok(Backup {
            files: detail
                .entries
                .into_iter()
                .map(|entry| entry.source_path)
                .collect(),
        })
    }

    /// Detailed backup: rotates, then returns entries with destination
    /// names and mutability flags. The listed sources are not renamed or
    /// deleted until the backup ends.
    pub fn begin_backup_detailed(&self) -> Result<BackupDetail, DatastoreError> {
        self.check_after_ready("begin_backup")?;
        let _guard = lock(&self.rotate_mutex);
        self.rotate_log_files_locked()?;

        let epoch = self.coordinator.durable_epoch();
        let log_dir = &self.config.log_dir;
        let detached = lock(&self.catalog).detached_pwals().clone();

        let mut entries = Vec::new();
        for path in self.ops.list_dir(log_dir)? {
            if self.ops.is_dir(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let entry = match classify_backup_file(name) {
                Some(is_mutable) => FileSetEntry {
                    source_path: path.clone(),
                    destination_path: PathBuf::from(name),
                    is_mutable,
                    is_detached: detached.contains(name),
                },
                None => continue,
            };
            entries.push(entry);
        }

        // BLOB files, preserved under their bucketed relative paths.
        let blob_root = self.resolver.blob_root();
        if self.ops.exists(blob_root) {
            for bucket in self.ops.list_dir(blob_root)? {
                if !self.ops.is_dir(&bucket) {
                    continue;
                }
                for blob in self.ops.list_dir(&bucket)? {
                    if let Ok(relative) = blob.strip_prefix(log_dir) {
                        entries.push(FileSetEntry {
                            source_path: blob.clone(),
                            destination_path: relative.to_path_buf(),
                            is_mutable: false,
                            is_detached: false,
                        });
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        info!(entries = entries.len(), epoch, "backup file set enumerated");
        Ok(BackupDetail { entries, epoch })
    }

    /// Opens a remote backup session over the current consistent file
    /// set.
    pub fn begin_backup_session(
        &self,
        begin_epoch: EpochId,
        end_epoch: EpochId,
    ) -> Result<SessionInfo, DatastoreError> {
        let detail = self.begin_backup_detailed()?;
        let bounds = EpochBounds {
            snapshot_epoch: lock(&self.catalog).max_epoch_id(),
            current_epoch: self.coordinator.switched_epoch(),
            boot_durable_epoch: self.boot_durable_epoch,
        };
        let objects = detail
            .entries
            .into_iter()
            .map(|entry| BackupObject {
                id: entry.destination_path.to_string_lossy().into_owned(),
                path: entry.source_path,
            })
            .collect();
        Ok(self
            .backup_sessions
            .begin_backup(begin_epoch, end_epoch, bounds, objects)?)
    }

    /// The protocol session manager (keep-alive, object streaming, end).
    pub fn backup_sessions(&self) -> &BackupSessionManager {
        &self.backup_sessions
    }

    /// Restores a whole-directory backup into the log directory.
    /// Pre-ready only.
    pub fn restore(&self, from: &Path, keep_backup: bool) -> RestoreStatus {
        if self.state.load(Ordering::SeqCst) != STATE_NOT_READY {
            warn!("restore called on a ready datastore");
            return RestoreStatus::ErrPermissionError;
        }
        crate::backup::restore(&self.config.log_dir, from, keep_backup, &*self.ops)
    }

    /// Restores from an explicit entry list. Pre-ready only.
    pub fn restore_entries(&self, from: &Path, entries: &[FileSetEntry]) -> RestoreStatus {
        if self.state.load(Ordering::SeqCst) != STATE_NOT_READY {
            warn!("restore called on a ready datastore");
            return RestoreStatus::ErrPermissionError;
        }
        crate::backup::restore_entries(&self.config.log_dir, from, entries, &*self.ops)
    }

    // --------------------------------------------------------------------------------------------
    // Tracked files
    // --------------------------------------------------------------------------------------------

    fn add_file(&self, path: PathBuf) {
        lock(&self.files).insert(path);
    }

    /// Paths currently tracked as part of the datastore image.
    pub fn tracked_files(&self) -> BTreeSet<PathBuf> {
        lock(&self.files).clone()
    }

    /// The log directory.
    pub fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        let collector = lock(&self.garbage_collector).take();
        if let Some(collector) = collector {
            collector.shutdown();
        }
    }
}

/// Classifies a log-directory file for backup: `Some(is_mutable)` to
/// include it, `None` to skip. Active WAL/epoch files are skipped — only
/// their rotated (immutable) forms belong to a consistent image.
fn classify_backup_file(name: &str) -> Option<bool> {
    match name {
        MANIFEST_FILE_NAME | CATALOG_FILE_NAME | HISTORY_FILE_NAME => Some(true),
        CATALOG_BACKUP_NAME => None,
        EPOCH_FILE_NAME => None,
        _ if name.ends_with(".tmp") || name.ends_with(".back") || name.ends_with(".migrating") => {
            None
        }
        _ if name.starts_with("epoch.") => Some(false),
        _ if name == COMPACTED_FILE_NAME => Some(false),
        _ if name.starts_with(PWAL_PREFIX) => {
            // Rotated names carry a suffix; active names do not.
            let after = &name[PWAL_PREFIX.len()..];
            if after.contains('.') { Some(false) } else { None }
        }
        _ => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
