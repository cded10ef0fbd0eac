//! BLOB registration pool.
//!
//! Writers stage new BLOBs through a pool acquired from the datastore:
//! each registration allocates a fresh BLOB id, places the payload at its
//! resolver path, and remembers the id. When the pool is released, every
//! registration that did not become persistent in the meantime is deleted
//! again — a transaction that aborts leaves no orphan BLOB files behind.
//!
//! BLOB failures are distinguished from session I/O failures so callers
//! can retry a registration without abandoning their write session.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::blob::resolver::BlobFileResolver;
use crate::fileio::FileOps;
use crate::record::BlobId;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by BLOB registration.
#[derive(Debug, Error)]
pub enum BlobError {
    /// A copy/move/write of BLOB payload failed.
    #[error("Blob I/O error during {operation}: {source}")]
    Io {
        /// Short description of the failed operation.
        operation: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The pool was used after `release()`.
    #[error("Blob pool has already been released")]
    Released,

    /// The source file of a registration does not exist.
    #[error("Blob source file not found: {0}")]
    SourceNotFound(String),
}

fn blob_io(operation: impl Into<String>) -> impl FnOnce(io::Error) -> BlobError {
    move |source| BlobError::Io {
        operation: operation.into(),
        source,
    }
}

// ------------------------------------------------------------------------------------------------
// BlobPool
// ------------------------------------------------------------------------------------------------

/// Pool for temporary registration of BLOBs.
///
/// Owned by the acquiring caller; the BLOB files it produces are owned by
/// the datastore once their ids are made persistent.
#[derive(Debug)]
pub struct BlobPool {
    resolver: Arc<BlobFileResolver>,
    file_ops: Arc<dyn FileOps>,
    next_blob_id: Arc<AtomicU64>,
    persistent_ids: Arc<Mutex<BTreeSet<BlobId>>>,
    registered: Mutex<Vec<BlobId>>,
    released: AtomicBool,
}

impl BlobPool {
    /// Creates a pool sharing the datastore's id allocator and persistent
    /// id set.
    pub(crate) fn new(
        resolver: Arc<BlobFileResolver>,
        file_ops: Arc<dyn FileOps>,
        next_blob_id: Arc<AtomicU64>,
        persistent_ids: Arc<Mutex<BTreeSet<BlobId>>>,
    ) -> Self {
        Self {
            resolver,
            file_ops,
            next_blob_id,
            persistent_ids,
            registered: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Registers BLOB payload from memory. Returns the allocated id.
    pub fn register_data(&self, data: &[u8]) -> Result<BlobId, BlobError> {
        self.check_open()?;
        let id = self.allocate_id();
        let path = self.resolver.resolve_path(id);
        self.ensure_bucket(&path)?;

        let mut file = self
            .file_ops
            .create(&path)
            .map_err(blob_io(format!("create {}", path.display())))?;
        file.write_all(data)
            .map_err(blob_io(format!("write {}", path.display())))?;
        self.file_ops
            .flush_and_sync(&mut file)
            .map_err(blob_io(format!("sync {}", path.display())))?;

        self.remember(id);
        debug!(blob_id = id, bytes = data.len(), "blob registered from data");
        Ok(id)
    }

    /// Registers an existing file as a BLOB. With `is_temporary` the
    /// source is moved into place, otherwise copied.
    pub fn register_file(&self, source: &Path, is_temporary: bool) -> Result<BlobId, BlobError> {
        self.check_open()?;
        if !self.file_ops.exists(source) {
            return Err(BlobError::SourceNotFound(source.display().to_string()));
        }
        let id = self.allocate_id();
        let path = self.resolver.resolve_path(id);
        self.ensure_bucket(&path)?;

        if is_temporary {
            self.file_ops
                .rename(source, &path)
                .map_err(blob_io(format!(
                    "move {} -> {}",
                    source.display(),
                    path.display()
                )))?;
        } else {
            self.file_ops
                .copy_file(source, &path)
                .map_err(blob_io(format!(
                    "copy {} -> {}",
                    source.display(),
                    path.display()
                )))?;
        }

        self.remember(id);
        debug!(blob_id = id, source = %source.display(), "blob registered from file");
        Ok(id)
    }

    /// Releases the pool: every registered BLOB whose id did not become
    /// persistent is deleted (best-effort). Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let registered = {
            let mut guard = self.registered_lock();
            std::mem::take(&mut *guard)
        };

        let persistent: Vec<BlobId> = {
            let mut set = match self.persistent_ids.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Ids confirmed persistent are no longer tracked by the pool;
            // drop them from the pending set as we go.
            registered
                .iter()
                .copied()
                .filter(|id| set.remove(id))
                .collect()
        };

        for id in registered {
            if persistent.contains(&id) {
                continue;
            }
            let path = self.resolver.resolve_path(id);
            match self.file_ops.remove_file(&path) {
                Ok(()) => debug!(blob_id = id, "unpersisted blob discarded"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(blob_id = id, error = %e, "failed to discard blob"),
            }
        }
    }

    fn check_open(&self) -> Result<(), BlobError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(BlobError::Released);
        }
        Ok(())
    }

    fn allocate_id(&self) -> BlobId {
        self.next_blob_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_bucket(&self, blob_path: &Path) -> Result<(), BlobError> {
        if let Some(parent) = blob_path.parent() {
            self.file_ops
                .create_dir_all(parent)
                .map_err(blob_io(format!("mkdir {}", parent.display())))?;
        }
        Ok(())
    }

    fn remember(&self, id: BlobId) {
        self.registered_lock().push(id);
    }

    fn registered_lock(&self) -> std::sync::MutexGuard<'_, Vec<BlobId>> {
        match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for BlobPool {
    fn drop(&mut self) {
        self.release();
    }
}
