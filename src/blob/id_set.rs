//! Latched BLOB id container.
//!
//! The garbage collector accumulates candidate and exempt ids from
//! background threads, then iterates the result exactly once while the
//! cleanup worker deletes files. To rule out scan threads racing the
//! cleanup, the container becomes **permanently read-only** the moment its
//! contents are first iterated; any later mutation is a logic error.

use std::sync::Mutex;

use crate::blob::GcError;
use crate::record::BlobId;

#[derive(Debug, Default)]
struct Inner {
    ids: Vec<BlobId>,
    locked: bool,
}

/// Thread-safe collection of BLOB ids with an iteration latch.
#[derive(Debug, Default)]
pub struct BlobIdSet {
    inner: Mutex<Inner>,
}

impl BlobIdSet {
    /// Creates an empty, unlocked container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one id.
    ///
    /// # Errors
    /// [`GcError::ContainerLocked`] once the container has been iterated.
    pub fn add(&self, id: BlobId) -> Result<(), GcError> {
        let mut inner = self.lock();
        if inner.locked {
            return Err(GcError::ContainerLocked);
        }
        inner.ids.push(id);
        Ok(())
    }

    /// Removes every id present in `other`, deduplicating this container.
    ///
    /// # Errors
    /// [`GcError::ContainerLocked`] once the container has been iterated.
    pub fn diff(&self, other: &BlobIdSet) -> Result<(), GcError> {
        let other_ids = other.sorted_snapshot();
        let mut inner = self.lock();
        if inner.locked {
            return Err(GcError::ContainerLocked);
        }
        inner.ids.sort_unstable();
        inner.ids.dedup();
        inner.ids.retain(|id| other_ids.binary_search(id).is_err());
        Ok(())
    }

    /// Merges the contents of `other` into this container.
    ///
    /// # Errors
    /// [`GcError::ContainerLocked`] once the container has been iterated.
    pub fn merge(&self, other: &BlobIdSet) -> Result<(), GcError> {
        let other_ids = other.sorted_snapshot();
        let mut inner = self.lock();
        if inner.locked {
            return Err(GcError::ContainerLocked);
        }
        inner.ids.extend(other_ids);
        Ok(())
    }

    /// Returns the sorted, deduplicated contents and latches the container
    /// read-only.
    pub fn lock_and_iter(&self) -> Vec<BlobId> {
        let mut inner = self.lock();
        inner.locked = true;
        inner.ids.sort_unstable();
        inner.ids.dedup();
        inner.ids.clone()
    }

    /// True if the id is present. Does not latch.
    pub fn contains(&self, id: BlobId) -> bool {
        self.lock().ids.contains(&id)
    }

    /// Number of ids currently held (before deduplication).
    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    /// True if no ids are held.
    pub fn is_empty(&self) -> bool {
        self.lock().ids.is_empty()
    }

    fn sorted_snapshot(&self) -> Vec<BlobId> {
        let mut ids = self.lock().ids.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
