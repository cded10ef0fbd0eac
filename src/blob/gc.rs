//! BLOB file garbage collector.
//!
//! Determines the set of BLOB files that are no longer referenced by any
//! live entry and deletes them, using up to three background workers:
//!
//! 1. **Blob scan** — walks the bucket directories under `blob/` and
//!    records every well-formed BLOB file whose id is ≤ the
//!    `max_existing_blob_id` given at scan start. Files with larger ids
//!    were created after the snapshot was fixed and are never candidates.
//! 2. **Snapshot scan** — streams the snapshot (+ compacted) image and
//!    records every referenced BLOB id as GC-exempt.
//! 3. **Cleanup** — waits for both scans, computes `candidates \ exempt`,
//!    and deletes the remainder through the injected [`FileOps`].
//!    Deletion errors other than "already gone" are logged and ignored.
//!
//! All transitions run through the [`GcStateMachine`]; a scan started
//! twice or completed out of order is a logic error, not a race.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::blob::id_set::BlobIdSet;
use crate::blob::resolver::BlobFileResolver;
use crate::blob::state_machine::{GcStateMachine, SnapshotScanMode};
use crate::blob::{GcError, GcState};
use crate::fileio::FileOps;
use crate::record::BlobId;
use crate::snapshot::SnapshotCursor;

// ------------------------------------------------------------------------------------------------
// Progress tracking shared with the workers
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProgressFlags {
    blob_scan_started: bool,
    blob_scan_complete: bool,
    snapshot_scan_started: bool,
    snapshot_scan_complete: bool,
    snapshot_scan_failed: bool,
    cleanup_started: bool,
    cleanup_complete: bool,
}

#[derive(Debug, Default)]
struct Progress {
    flags: Mutex<ProgressFlags>,
    cv: Condvar,
}

impl Progress {
    fn lock(&self) -> MutexGuard<'_, ProgressFlags> {
        match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut ProgressFlags)) {
        let mut flags = self.lock();
        f(&mut flags);
        drop(flags);
        self.cv.notify_all();
    }
}

#[derive(Debug, Default)]
struct Workers {
    blob_scan: Option<JoinHandle<()>>,
    snapshot_scan: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// BlobFileGarbageCollector
// ------------------------------------------------------------------------------------------------

/// Scans the BLOB directory and the live snapshot, intersects, and deletes
/// unreferenced BLOB files.
///
/// `scan_blob_files` may be called at most once per collector lifetime;
/// every compaction run uses a fresh collector.
#[derive(Debug)]
pub struct BlobFileGarbageCollector {
    state_machine: Arc<GcStateMachine>,
    resolver: Arc<BlobFileResolver>,
    scanned: Arc<BlobIdSet>,
    exempt: Arc<BlobIdSet>,
    file_ops: Arc<dyn FileOps>,
    max_existing_blob_id: AtomicU64,
    blob_scan_requested: AtomicBool,
    shutdown_requested: Arc<AtomicBool>,
    progress: Arc<Progress>,
    workers: Mutex<Workers>,
}

impl BlobFileGarbageCollector {
    /// Creates an idle collector over the given resolver.
    pub fn new(resolver: Arc<BlobFileResolver>, file_ops: Arc<dyn FileOps>) -> Self {
        Self {
            state_machine: Arc::new(GcStateMachine::new()),
            resolver,
            scanned: Arc::new(BlobIdSet::new()),
            exempt: Arc::new(BlobIdSet::new()),
            file_ops,
            max_existing_blob_id: AtomicU64::new(0),
            blob_scan_requested: AtomicBool::new(false),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Progress::default()),
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Current state of the GC state machine.
    pub fn state(&self) -> GcState {
        self.state_machine.state()
    }

    /// True while any scan or cleanup phase is underway.
    pub fn is_active(&self) -> bool {
        !matches!(
            self.state(),
            GcState::NotStarted | GcState::Completed | GcState::Shutdown
        )
    }

    /// Launches the background disk scan. Only files with id ≤ `max_existing_blob_id`
    /// become deletion candidates.
    ///
    /// # Errors
    /// [`GcError::ScanAlreadyStarted`] on a second call;
    /// [`GcError::InvalidTransition`] if the machine forbids the start.
    pub fn scan_blob_files(&self, max_existing_blob_id: BlobId) -> Result<(), GcError> {
        if self.blob_scan_requested.swap(true, Ordering::SeqCst) {
            return Err(GcError::ScanAlreadyStarted);
        }
        self.state_machine.start_blob_scan()?;
        self.max_existing_blob_id
            .store(max_existing_blob_id, Ordering::SeqCst);
        self.progress.update(|f| f.blob_scan_started = true);

        let resolver = Arc::clone(&self.resolver);
        let scanned = Arc::clone(&self.scanned);
        let file_ops = Arc::clone(&self.file_ops);
        let state_machine = Arc::clone(&self.state_machine);
        let progress = Arc::clone(&self.progress);
        let shutdown = Arc::clone(&self.shutdown_requested);

        let handle = std::thread::Builder::new()
            .name("blob-gc-scan".into())
            .spawn(move || {
                scan_directory(
                    &resolver,
                    &*file_ops,
                    &scanned,
                    max_existing_blob_id,
                    &shutdown,
                );
                if !shutdown.load(Ordering::SeqCst)
                    && let Err(e) = state_machine.complete_blob_scan()
                {
                    error!(error = %e, "blob scan completion rejected");
                }
                progress.update(|f| f.blob_scan_complete = true);
            })
            .map_err(|e| GcError::WorkerSpawn(e.to_string()))?;

        self.workers_lock().blob_scan = Some(handle);
        Ok(())
    }

    /// Records a BLOB id that must not be deleted.
    pub fn add_gc_exempt_blob_id(&self, id: BlobId) -> Result<(), GcError> {
        self.exempt.add(id)
    }

    /// Launches the background snapshot scan: every BLOB referenced by the
    /// snapshot (merged with `compacted_file` if present) becomes exempt.
    pub fn scan_snapshot(
        &self,
        snapshot_file: PathBuf,
        compacted_file: Option<PathBuf>,
    ) -> Result<(), GcError> {
        self.state_machine
            .start_snapshot_scan(SnapshotScanMode::Internal)?;
        self.progress.update(|f| f.snapshot_scan_started = true);

        let exempt = Arc::clone(&self.exempt);
        let state_machine = Arc::clone(&self.state_machine);
        let progress = Arc::clone(&self.progress);
        let shutdown = Arc::clone(&self.shutdown_requested);

        let handle = std::thread::Builder::new()
            .name("blob-gc-snapshot".into())
            .spawn(move || {
                let failed = !scan_snapshot_streams(&snapshot_file, compacted_file.as_deref(), &exempt);
                if !shutdown.load(Ordering::SeqCst)
                    && let Err(e) = state_machine.complete_snapshot_scan(SnapshotScanMode::Internal)
                {
                    error!(error = %e, "snapshot scan completion rejected");
                }
                progress.update(|f| {
                    f.snapshot_scan_failed = failed;
                    f.snapshot_scan_complete = true;
                });
            })
            .map_err(|e| GcError::WorkerSpawn(e.to_string()))?;

        self.workers_lock().snapshot_scan = Some(handle);
        Ok(())
    }

    /// Marks the start of an externally-driven snapshot scan; exempt ids
    /// are then pushed in via [`add_gc_exempt_blob_id`](Self::add_gc_exempt_blob_id).
    pub fn start_external_snapshot_scan(&self) -> Result<(), GcError> {
        self.state_machine
            .start_snapshot_scan(SnapshotScanMode::External)?;
        self.progress.update(|f| f.snapshot_scan_started = true);
        Ok(())
    }

    /// Completes an externally-driven snapshot scan.
    pub fn complete_external_snapshot_scan(&self) -> Result<(), GcError> {
        self.state_machine
            .complete_snapshot_scan(SnapshotScanMode::External)?;
        self.progress.update(|f| f.snapshot_scan_complete = true);
        Ok(())
    }

    /// Spawns the cleanup worker: waits until both scans completed, then
    /// deletes `candidates \ exempt` best-effort.
    pub fn finalize_scan_and_cleanup(&self) {
        self.progress.update(|f| f.cleanup_started = true);

        let scanned = Arc::clone(&self.scanned);
        let exempt = Arc::clone(&self.exempt);
        let resolver = Arc::clone(&self.resolver);
        let file_ops = Arc::clone(&self.file_ops);
        let state_machine = Arc::clone(&self.state_machine);
        let progress = Arc::clone(&self.progress);
        let shutdown = Arc::clone(&self.shutdown_requested);

        let handle = std::thread::Builder::new()
            .name("blob-gc-cleanup".into())
            .spawn(move || {
                // Wait for both scans (or shutdown).
                let scan_failed;
                {
                    let mut flags = match progress.flags.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    while !(flags.blob_scan_complete && flags.snapshot_scan_complete)
                        && !shutdown.load(Ordering::SeqCst)
                    {
                        flags = match progress.cv.wait(flags) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    scan_failed = flags.snapshot_scan_failed;
                }

                if shutdown.load(Ordering::SeqCst) {
                    progress.update(|f| f.cleanup_complete = true);
                    return;
                }

                if scan_failed {
                    warn!("snapshot scan failed, skipping blob deletion");
                } else {
                    if let Err(e) = scanned.diff(&exempt) {
                        error!(error = %e, "candidate set diff rejected");
                        progress.update(|f| f.cleanup_complete = true);
                        return;
                    }
                    let candidates = scanned.lock_and_iter();
                    let mut deleted = 0usize;
                    for id in candidates {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        let path = resolver.resolve_path(id);
                        match file_ops.remove_file(&path) {
                            Ok(()) => deleted += 1,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                warn!(blob_id = id, path = %path.display(), error = %e,
                                      "failed to delete blob file");
                            }
                        }
                    }
                    info!(deleted, "blob garbage collection finished");
                }

                if !shutdown.load(Ordering::SeqCst)
                    && let Err(e) = state_machine.complete_cleanup()
                {
                    error!(error = %e, "cleanup completion rejected");
                }
                progress.update(|f| f.cleanup_complete = true);
            });

        match handle {
            Ok(handle) => self.workers_lock().cleanup = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn cleanup thread"),
        }
    }

    /// Stops all background work and joins every worker. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.state_machine.shutdown();
        self.progress.cv.notify_all();

        let workers = {
            let mut guard = self.workers_lock();
            Workers {
                blob_scan: guard.blob_scan.take(),
                snapshot_scan: guard.snapshot_scan.take(),
                cleanup: guard.cleanup.take(),
            }
        };
        for handle in [workers.blob_scan, workers.snapshot_scan, workers.cleanup]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("blob gc worker panicked");
            }
        }
        debug!("blob garbage collector shut down");
    }

    /// Blocks until every started worker has completed its phase.
    pub fn wait_for_all_threads(&self) {
        let mut flags = self.progress.lock();
        loop {
            let all_done = (!flags.blob_scan_started || flags.blob_scan_complete)
                && (!flags.snapshot_scan_started || flags.snapshot_scan_complete)
                && (!flags.cleanup_started || flags.cleanup_complete);
            if all_done {
                return;
            }
            flags = match self.progress.cv.wait(flags) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn workers_lock(&self) -> MutexGuard<'_, Workers> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for BlobFileGarbageCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// Worker bodies
// ------------------------------------------------------------------------------------------------

/// Walks `blob/dir_NN` directories collecting candidate ids ≤ `max_id`.
fn scan_directory(
    resolver: &BlobFileResolver,
    file_ops: &dyn FileOps,
    scanned: &BlobIdSet,
    max_id: BlobId,
    shutdown: &AtomicBool,
) {
    let root = resolver.blob_root();
    if !file_ops.exists(root) {
        debug!(root = %root.display(), "blob root missing, nothing to scan");
        return;
    }

    let buckets = match file_ops.list_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "failed to list blob root");
            return;
        }
    };

    let mut found = 0usize;
    for bucket in buckets {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if !file_ops.is_dir(&bucket) {
            continue;
        }
        let files = match file_ops.list_dir(&bucket) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %bucket.display(), error = %e, "failed to list blob bucket");
                continue;
            }
        };
        for file in files {
            let Some(id) = resolver.extract_blob_id(&file) else {
                continue;
            };
            if id > max_id {
                continue;
            }
            if let Err(e) = scanned.add(id) {
                error!(blob_id = id, error = %e, "blob candidate rejected");
                return;
            }
            found += 1;
        }
    }
    debug!(found, max_id, "blob directory scan finished");
}

/// Streams the snapshot image, adding every referenced BLOB id to the
/// exempt set. Returns false on a read failure.
fn scan_snapshot_streams(
    snapshot_file: &std::path::Path,
    compacted_file: Option<&std::path::Path>,
    exempt: &BlobIdSet,
) -> bool {
    let cursor = match compacted_file {
        Some(compacted) => SnapshotCursor::open_with_compacted(snapshot_file, compacted),
        None => SnapshotCursor::open(snapshot_file),
    };
    let mut cursor = match cursor {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(error = %e, "failed to open snapshot for gc scan");
            return false;
        }
    };

    loop {
        match cursor.next() {
            Ok(Some(entry)) => {
                for id in &entry.blob_ids {
                    if let Err(e) = exempt.add(*id) {
                        error!(blob_id = id, error = %e, "gc exempt id rejected");
                        return false;
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "snapshot scan failed");
                return false;
            }
        }
    }
}
