//! # BLOB Lifecycle Management
//!
//! Large binary objects are stored out-of-line, one file per BLOB id,
//! bucketed under `blob/dir_NN/` by `id mod 100`. This module owns the
//! whole lifecycle:
//!
//! - [`resolver`] — deterministic id → path mapping and name validation;
//! - [`pool`] — temporary registration of new BLOBs by writers, with
//!   discard-on-release for BLOBs that never became durable;
//! - [`id_set`] — the candidate/exempt id containers used by the garbage
//!   collector, read-only once iterated;
//! - [`state_machine`] — the exhaustive (state, event) transition table
//!   that forbids unsafe GC interleavings;
//! - [`gc`] — the collector itself: a blob-directory scan and a snapshot
//!   scan feeding a cleanup worker that deletes unreferenced files.
//!
//! The collector runs at most three background threads (blob scan,
//! snapshot scan, cleanup), each joined at shutdown.

pub mod gc;
pub mod id_set;
pub mod pool;
pub mod resolver;
pub mod state_machine;

#[cfg(test)]
mod tests;

pub use gc::BlobFileGarbageCollector;
pub use id_set::BlobIdSet;
pub use pool::{BlobError, BlobPool};
pub use resolver::BlobFileResolver;
pub use state_machine::{GcEvent, GcState, GcStateMachine, SnapshotScanMode};

use thiserror::Error;

/// Logic-violation errors raised by the garbage collector and its state
/// machine. These always indicate API misuse, never an I/O condition.
#[derive(Debug, Error)]
pub enum GcError {
    /// The event is not defined for the current state.
    #[error("Invalid GC transition: {event} not allowed in state {state}")]
    InvalidTransition {
        /// State the machine was in.
        state: GcState,
        /// Event that was rejected.
        event: GcEvent,
    },

    /// `scan_blob_files` may be called at most once per collector lifetime.
    #[error("Blob file scan has already been started")]
    ScanAlreadyStarted,

    /// A snapshot-scan completion carried a different mode than its start.
    #[error("Snapshot scan mode mismatch: started {started}, completed {completed}")]
    ModeMismatch {
        /// Mode given to `start_snapshot_scan`.
        started: SnapshotScanMode,
        /// Mode given to the completing event.
        completed: SnapshotScanMode,
    },

    /// The id container was mutated after becoming read-only.
    #[error("Blob id container is locked for modifications")]
    ContainerLocked,

    /// A background worker could not be spawned.
    #[error("Failed to spawn GC worker thread: {0}")]
    WorkerSpawn(String),
}
