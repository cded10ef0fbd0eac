//! GC state machine.
//!
//! Tracks the progress of the two scans and the cleanup phase of BLOB
//! garbage collection. The transition table is exhaustive and enforced:
//! any (state, event) pair not listed fails with a logic-violation error,
//! which is how unsafe interleavings (double-starting a scan, completing a
//! scan that never started, cleaning up early) are ruled out.
//!
//! `Shutdown` is accepted from every state and collapses to `Shutdown`;
//! `Reset` is accepted only from `Shutdown` and returns to `NotStarted`.
//! Snapshot scans are tagged with a mode (internal or external) and the
//! completing event must carry the same mode as the starting event.

use std::fmt;
use std::sync::Mutex;

use crate::blob::GcError;

// ------------------------------------------------------------------------------------------------
// States and events
// ------------------------------------------------------------------------------------------------

/// State of the BLOB file garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcState {
    /// Initial state, no scan has started.
    #[default]
    NotStarted,
    /// Scanning BLOB files, snapshot scan has not started.
    ScanningBlobOnly,
    /// Scanning snapshot, BLOB scan has not started.
    ScanningSnapshotOnly,
    /// Both BLOB and snapshot scans are in progress.
    ScanningBoth,
    /// BLOB scan completed, snapshot scan has not started.
    BlobScanCompletedSnapshotNotStarted,
    /// BLOB scan completed, snapshot scan is in progress.
    BlobScanCompletedSnapshotInProgress,
    /// Snapshot scan completed, BLOB scan has not started.
    SnapshotScanCompletedBlobNotStarted,
    /// Snapshot scan completed, BLOB scan is in progress.
    SnapshotScanCompletedBlobInProgress,
    /// Both scans completed, cleanup in progress.
    CleaningUp,
    /// Cleanup completed, no further actions required.
    Completed,
    /// Shutdown initiated, terminating all operations.
    Shutdown,
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcState::NotStarted => "not_started",
            GcState::ScanningBlobOnly => "scanning_blob_only",
            GcState::ScanningSnapshotOnly => "scanning_snapshot_only",
            GcState::ScanningBoth => "scanning_both",
            GcState::BlobScanCompletedSnapshotNotStarted => {
                "blob_scan_completed_snapshot_not_started"
            }
            GcState::BlobScanCompletedSnapshotInProgress => {
                "blob_scan_completed_snapshot_in_progress"
            }
            GcState::SnapshotScanCompletedBlobNotStarted => {
                "snapshot_scan_completed_blob_not_started"
            }
            GcState::SnapshotScanCompletedBlobInProgress => {
                "snapshot_scan_completed_blob_in_progress"
            }
            GcState::CleaningUp => "cleaning_up",
            GcState::Completed => "completed",
            GcState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Event triggering a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    StartBlobScan,
    StartSnapshotScan,
    CompleteBlobScan,
    CompleteSnapshotScan,
    CompleteCleanup,
    Shutdown,
    Reset,
}

impl fmt::Display for GcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcEvent::StartBlobScan => "start_blob_scan",
            GcEvent::StartSnapshotScan => "start_snapshot_scan",
            GcEvent::CompleteBlobScan => "complete_blob_scan",
            GcEvent::CompleteSnapshotScan => "complete_snapshot_scan",
            GcEvent::CompleteCleanup => "complete_cleanup",
            GcEvent::Shutdown => "shutdown",
            GcEvent::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Origin of the snapshot scan feeding GC-exempt ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotScanMode {
    /// Scan not started yet.
    #[default]
    None,
    /// The collector executes the scan itself.
    Internal,
    /// Scan results are pushed in from an external source.
    External,
}

impl fmt::Display for SnapshotScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotScanMode::None => "none",
            SnapshotScanMode::Internal => "internal",
            SnapshotScanMode::External => "external",
        };
        f.write_str(name)
    }
}

// ------------------------------------------------------------------------------------------------
// Transition table
// ------------------------------------------------------------------------------------------------

/// Returns the next state if the transition is defined, `None` otherwise.
pub fn next_state(current: GcState, event: GcEvent) -> Option<GcState> {
    use GcEvent as E;
    use GcState as S;

    // Shutdown collapses from every state; Reset only leaves Shutdown.
    match (current, event) {
        (_, E::Shutdown) => Some(S::Shutdown),
        (S::Shutdown, E::Reset) => Some(S::NotStarted),

        (S::NotStarted, E::StartBlobScan) => Some(S::ScanningBlobOnly),
        (S::NotStarted, E::StartSnapshotScan) => Some(S::ScanningSnapshotOnly),

        (S::ScanningBlobOnly, E::StartSnapshotScan) => Some(S::ScanningBoth),
        (S::ScanningBlobOnly, E::CompleteBlobScan) => {
            Some(S::BlobScanCompletedSnapshotNotStarted)
        }

        (S::ScanningSnapshotOnly, E::StartBlobScan) => Some(S::ScanningBoth),
        (S::ScanningSnapshotOnly, E::CompleteSnapshotScan) => {
            Some(S::SnapshotScanCompletedBlobNotStarted)
        }

        (S::ScanningBoth, E::CompleteBlobScan) => Some(S::BlobScanCompletedSnapshotInProgress),
        (S::ScanningBoth, E::CompleteSnapshotScan) => {
            Some(S::SnapshotScanCompletedBlobInProgress)
        }

        (S::BlobScanCompletedSnapshotNotStarted, E::StartSnapshotScan) => {
            Some(S::BlobScanCompletedSnapshotInProgress)
        }
        (S::BlobScanCompletedSnapshotNotStarted, E::CompleteSnapshotScan) => Some(S::CleaningUp),

        (S::SnapshotScanCompletedBlobNotStarted, E::StartBlobScan) => {
            Some(S::SnapshotScanCompletedBlobInProgress)
        }
        (S::SnapshotScanCompletedBlobNotStarted, E::CompleteBlobScan) => Some(S::CleaningUp),

        (S::BlobScanCompletedSnapshotInProgress, E::CompleteSnapshotScan) => Some(S::CleaningUp),
        (S::SnapshotScanCompletedBlobInProgress, E::CompleteBlobScan) => Some(S::CleaningUp),

        (S::CleaningUp, E::CompleteCleanup) => Some(S::Completed),

        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// GcStateMachine
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MachineInner {
    state: GcState,
    scan_mode: SnapshotScanMode,
}

/// Mutex-guarded state machine instance.
#[derive(Debug, Default)]
pub struct GcStateMachine {
    inner: Mutex<MachineInner>,
}

impl GcStateMachine {
    /// Creates a machine in `NotStarted`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initiates the BLOB file scan.
    pub fn start_blob_scan(&self) -> Result<GcState, GcError> {
        self.transition(GcEvent::StartBlobScan)
    }

    /// Initiates the snapshot scan, recording its mode.
    pub fn start_snapshot_scan(&self, mode: SnapshotScanMode) -> Result<GcState, GcError> {
        let mut inner = self.lock();
        let state = Self::apply(&mut inner, GcEvent::StartSnapshotScan)?;
        inner.scan_mode = mode;
        Ok(state)
    }

    /// Marks the BLOB file scan as completed.
    pub fn complete_blob_scan(&self) -> Result<GcState, GcError> {
        self.transition(GcEvent::CompleteBlobScan)
    }

    /// Marks the snapshot scan as completed; `mode` must match the mode
    /// given at start.
    pub fn complete_snapshot_scan(&self, mode: SnapshotScanMode) -> Result<GcState, GcError> {
        let mut inner = self.lock();
        if inner.scan_mode != mode {
            return Err(GcError::ModeMismatch {
                started: inner.scan_mode,
                completed: mode,
            });
        }
        Self::apply(&mut inner, GcEvent::CompleteSnapshotScan)
    }

    /// Marks the cleanup phase as completed.
    pub fn complete_cleanup(&self) -> Result<GcState, GcError> {
        self.transition(GcEvent::CompleteCleanup)
    }

    /// Initiates shutdown; valid from every state.
    pub fn shutdown(&self) -> GcState {
        let mut inner = self.lock();
        inner.state = GcState::Shutdown;
        inner.state
    }

    /// Returns to `NotStarted`. Only valid from `Shutdown`.
    pub fn reset(&self) -> Result<GcState, GcError> {
        let mut inner = self.lock();
        let state = Self::apply(&mut inner, GcEvent::Reset)?;
        inner.scan_mode = SnapshotScanMode::None;
        Ok(state)
    }

    /// Current state.
    pub fn state(&self) -> GcState {
        self.lock().state
    }

    /// Mode recorded at `start_snapshot_scan`.
    pub fn snapshot_scan_mode(&self) -> SnapshotScanMode {
        self.lock().scan_mode
    }

    /// Applies a raw event.
    pub fn transition(&self, event: GcEvent) -> Result<GcState, GcError> {
        let mut inner = self.lock();
        Self::apply(&mut inner, event)
    }

    fn apply(inner: &mut MachineInner, event: GcEvent) -> Result<GcState, GcError> {
        match next_state(inner.state, event) {
            Some(next) => {
                inner.state = next;
                Ok(next)
            }
            None => Err(GcError::InvalidTransition {
                state: inner.state,
                event,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
