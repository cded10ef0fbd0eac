//! # Epoch Coordinator
//!
//! Process-wide durability bookkeeping. Epochs are monotonically
//! increasing integers; durability is an **epoch** property, not a
//! per-entry property. The coordinator maintains four atomic watermarks
//! whose invariant chain holds at all times:
//!
//! ```text
//! epoch_id_informed ≤ epoch_id_record_finished ≤ epoch_id_to_be_recorded ≤ epoch_id_switched
//! ```
//!
//! - `epoch_id_switched` — the epoch the datastore most recently
//!   transitioned to via [`EpochCoordinator::switch_epoch`].
//! - `epoch_id_to_be_recorded` — the highest epoch whose sessions have all
//!   ended; the candidate for the next durable marker.
//! - `epoch_id_record_finished` — the highest epoch whose durable marker
//!   has been written and fsync'd to the epoch file.
//! - `epoch_id_informed` — the highest epoch surfaced to the application
//!   through the persistent callback.
//!
//! [`EpochCoordinator::update_min_epoch_id`] advances the chain: it
//! computes the highest epoch with no in-flight session, raises
//! `to_be_recorded` by CAS, appends + fsyncs a durable marker under the
//! epoch-file mutex when needed, and finally raises `informed`, invoking
//! the persistent callback in strictly increasing epoch order.
//!
//! The externally advertised durable epoch therefore never overtakes the
//! slowest in-flight writer: a session that captured epoch `e` at begin
//! pins the advance to at most `e − 1` until it ends.
//!
//! ## Rendezvous hooks
//!
//! Tests need to interleave `switch_epoch`, session begin/end, and the
//! update path deterministically. [`RendezvousHooks`] exposes pluggable
//! callbacks fired around each load/CAS of the update sequence; the
//! default hooks do nothing.

#[cfg(test)]
mod tests;

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::fileio::FileOps;
use crate::record::{self, EpochId, LogRecord, RecordError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Active epoch file name inside the log directory.
pub const EPOCH_FILE_NAME: &str = "epoch";

/// Channel watermark value meaning "no session open".
pub const NO_SESSION: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by epoch coordination. Failures on the epoch-file path
/// are durability-impacting and always surfaced.
#[derive(Debug, Error)]
pub enum EpochError {
    /// Underlying I/O error on the epoch file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record framing failure while reading an epoch file.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// `switch_epoch` with a non-increasing epoch id.
    #[error("switch_epoch must be strictly increasing: requested {requested}, current {current}")]
    NonMonotonic {
        /// Epoch id that was requested.
        requested: EpochId,
        /// Current switched epoch.
        current: EpochId,
    },
}

// ------------------------------------------------------------------------------------------------
// Channel watermarks
// ------------------------------------------------------------------------------------------------

/// Per-channel epoch watermarks shared with the coordinator.
///
/// `current_epoch` holds the epoch captured at `begin_session`
/// ([`NO_SESSION`] while idle); `finished_epoch` the epoch of the most
/// recently finished session.
#[derive(Debug)]
pub struct ChannelMarks {
    current_epoch: AtomicU64,
    finished_epoch: AtomicU64,
}

impl Default for ChannelMarks {
    fn default() -> Self {
        Self {
            current_epoch: AtomicU64::new(NO_SESSION),
            finished_epoch: AtomicU64::new(0),
        }
    }
}

impl ChannelMarks {
    /// Fresh marks with no session and no finished epoch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session begin at `epoch`.
    pub fn begin(&self, epoch: EpochId) {
        self.current_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Records the session end, publishing the finished epoch.
    pub fn end(&self, epoch: EpochId) {
        self.finished_epoch.store(epoch, Ordering::SeqCst);
        self.current_epoch.store(NO_SESSION, Ordering::SeqCst);
    }

    /// Epoch of the open session, or [`NO_SESSION`].
    pub fn current(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Most recently finished session epoch.
    pub fn finished(&self) -> EpochId {
        self.finished_epoch.load(Ordering::SeqCst)
    }
}

// ------------------------------------------------------------------------------------------------
// Rendezvous hooks
// ------------------------------------------------------------------------------------------------

/// A single rendezvous callback.
pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Pluggable rendezvous points around the watermark loads and CASes of
/// [`EpochCoordinator::update_min_epoch_id`]. Tests install callbacks to
/// pause or interleave threads at exact points; production leaves them
/// empty.
#[derive(Default)]
pub struct RendezvousHooks {
    /// After `epoch_id_switched` is stored by `switch_epoch`.
    pub on_switch_epoch_store: Option<Hook>,
    /// After `epoch_id_switched` is loaded in the update path.
    pub on_switched_load: Option<Hook>,
    /// After the per-channel session minimum is computed.
    pub on_session_min_computed: Option<Hook>,
    /// After the `epoch_id_to_be_recorded` CAS.
    pub on_to_be_recorded_cas: Option<Hook>,
    /// After `epoch_id_record_finished` is loaded for the fsync decision.
    pub on_record_finished_load: Option<Hook>,
    /// After the `epoch_id_informed` advance.
    pub on_informed_advance: Option<Hook>,
}

impl std::fmt::Debug for RendezvousHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousHooks").finish_non_exhaustive()
    }
}

fn fire(hook: &Option<Hook>) {
    if let Some(hook) = hook {
        hook();
    }
}

// ------------------------------------------------------------------------------------------------
// EpochCoordinator
// ------------------------------------------------------------------------------------------------

/// Callback invoked when the durable epoch advances.
pub type PersistentCallback = Box<dyn Fn(EpochId) + Send + Sync>;

struct EpochFileState {
    file: std::fs::File,
    rotation_seq: u64,
}

/// Process-wide epoch state with the four atomic watermarks.
pub struct EpochCoordinator {
    log_dir: PathBuf,
    ops: Arc<dyn FileOps>,

    epoch_id_switched: AtomicU64,
    epoch_id_to_be_recorded: AtomicU64,
    epoch_id_record_finished: AtomicU64,
    epoch_id_informed: AtomicU64,

    /// Guards the channel marks vector.
    channels: Mutex<Vec<Arc<ChannelMarks>>>,

    /// Serializes writes to the epoch file.
    epoch_file: Mutex<EpochFileState>,

    /// Serializes persistent-callback invocation and informed advances.
    informed_mutex: Mutex<()>,
    cv_informed: Condvar,

    persistent_callback: Mutex<Option<PersistentCallback>>,
    hooks: RendezvousHooks,
}

impl std::fmt::Debug for EpochCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochCoordinator")
            .field("switched", &self.epoch_id_switched)
            .field("to_be_recorded", &self.epoch_id_to_be_recorded)
            .field("record_finished", &self.epoch_id_record_finished)
            .field("informed", &self.epoch_id_informed)
            .finish_non_exhaustive()
    }
}

impl EpochCoordinator {
    /// Opens the coordinator over `log_dir`, seeding every watermark with
    /// `initial_epoch` (the max durable epoch found during recovery).
    pub fn new(
        log_dir: impl Into<PathBuf>,
        initial_epoch: EpochId,
        ops: Arc<dyn FileOps>,
    ) -> Result<Self, EpochError> {
        Self::with_hooks(log_dir, initial_epoch, ops, RendezvousHooks::default())
    }

    /// Like [`new`](Self::new) with explicit rendezvous hooks.
    pub fn with_hooks(
        log_dir: impl Into<PathBuf>,
        initial_epoch: EpochId,
        ops: Arc<dyn FileOps>,
        hooks: RendezvousHooks,
    ) -> Result<Self, EpochError> {
        let log_dir = log_dir.into();
        let file = ops.open_append(&log_dir.join(EPOCH_FILE_NAME))?;

        Ok(Self {
            log_dir,
            ops,
            epoch_id_switched: AtomicU64::new(initial_epoch),
            epoch_id_to_be_recorded: AtomicU64::new(initial_epoch),
            epoch_id_record_finished: AtomicU64::new(initial_epoch),
            epoch_id_informed: AtomicU64::new(initial_epoch),
            channels: Mutex::new(Vec::new()),
            epoch_file: Mutex::new(EpochFileState {
                file,
                rotation_seq: 0,
            }),
            informed_mutex: Mutex::new(()),
            cv_informed: Condvar::new(),
            persistent_callback: Mutex::new(None),
            hooks,
        })
    }

    /// Registers a channel's watermarks with the coordinator.
    pub fn register_channel(&self, marks: Arc<ChannelMarks>) {
        lock(&self.channels).push(marks);
    }

    /// Installs the callback invoked (in strictly increasing epoch order)
    /// whenever the durable epoch advances.
    pub fn set_persistent_callback(&self, callback: PersistentCallback) {
        *lock(&self.persistent_callback) = Some(callback);
    }

    // --------------------------------------------------------------------------------------------
    // Watermark accessors
    // --------------------------------------------------------------------------------------------

    /// Most recent epoch switched to.
    pub fn switched_epoch(&self) -> EpochId {
        self.epoch_id_switched.load(Ordering::SeqCst)
    }

    /// Highest epoch whose sessions have all ended.
    pub fn to_be_recorded_epoch(&self) -> EpochId {
        self.epoch_id_to_be_recorded.load(Ordering::SeqCst)
    }

    /// Highest epoch with a durable marker on stable storage.
    pub fn durable_epoch(&self) -> EpochId {
        self.epoch_id_record_finished.load(Ordering::SeqCst)
    }

    /// Highest epoch surfaced through the persistent callback.
    pub fn informed_epoch(&self) -> EpochId {
        self.epoch_id_informed.load(Ordering::SeqCst)
    }

    // --------------------------------------------------------------------------------------------
    // switch_epoch
    // --------------------------------------------------------------------------------------------

    /// Transitions the datastore to `epoch`, which must be strictly
    /// greater than the previous switched epoch, then advances the
    /// durability chain.
    pub fn switch_epoch(&self, epoch: EpochId) -> Result<(), EpochError> {
        let current = self.epoch_id_switched.load(Ordering::SeqCst);
        if epoch <= current {
            return Err(EpochError::NonMonotonic {
                requested: epoch,
                current,
            });
        }
        self.epoch_id_switched.store(epoch, Ordering::SeqCst);
        fire(&self.hooks.on_switch_epoch_store);
        trace!(epoch, "epoch switched");

        self.update_min_epoch_id(true)
    }

    // --------------------------------------------------------------------------------------------
    // update_min_epoch_id — the heart of durability
    // --------------------------------------------------------------------------------------------

    /// Advances `to_be_recorded`, the durable marker, and the informed
    /// watermark as far as the in-flight sessions allow.
    ///
    /// Let C be the minimum epoch captured by any open session. The
    /// durable candidate is `min(C − 1, switched − 1)`: entries of the
    /// current epoch are still being produced, and a session that began in
    /// epoch `e` pins everything from `e` upward.
    pub fn update_min_epoch_id(&self, from_switch: bool) -> Result<(), EpochError> {
        let switched = self.epoch_id_switched.load(Ordering::SeqCst);
        fire(&self.hooks.on_switched_load);
        if switched == 0 {
            return Ok(());
        }

        let min_session = lock(&self.channels)
            .iter()
            .map(|marks| marks.current())
            .min()
            .unwrap_or(NO_SESSION);
        fire(&self.hooks.on_session_min_computed);

        let target = min_session.saturating_sub(1).min(switched - 1);

        // Raise to_be_recorded (upward CAS, never lowers).
        let raised = cas_max(&self.epoch_id_to_be_recorded, target);
        fire(&self.hooks.on_to_be_recorded_cas);
        if raised {
            trace!(target, from_switch, "to_be_recorded advanced");
        }

        // Persist the durable marker if it lags.
        fire(&self.hooks.on_record_finished_load);
        if self.epoch_id_record_finished.load(Ordering::SeqCst)
            < self.epoch_id_to_be_recorded.load(Ordering::SeqCst)
        {
            let mut state = lock(&self.epoch_file);
            let to_record = self.epoch_id_to_be_recorded.load(Ordering::SeqCst);
            if self.epoch_id_record_finished.load(Ordering::SeqCst) < to_record {
                record::write_record(&mut state.file, &LogRecord::MarkerDurable { epoch: to_record })?;
                self.ops.flush_and_sync(&mut state.file)?;
                cas_max(&self.epoch_id_record_finished, to_record);
                debug!(epoch = to_record, "durable marker persisted");
            }
        }

        // Advance informed and invoke the persistent callback. The
        // informed mutex serializes invocations so the advertised sequence
        // is strictly increasing.
        let finished = self.epoch_id_record_finished.load(Ordering::SeqCst);
        {
            let _guard = lock(&self.informed_mutex);
            if self.epoch_id_informed.load(Ordering::SeqCst) < finished {
                self.epoch_id_informed.store(finished, Ordering::SeqCst);
                fire(&self.hooks.on_informed_advance);
                if let Some(callback) = lock(&self.persistent_callback).as_ref() {
                    callback(finished);
                }
                self.cv_informed.notify_all();
            }
        }

        Ok(())
    }

    /// Blocks until the informed epoch reaches `epoch` or the timeout
    /// elapses. Returns the informed epoch at wakeup.
    pub fn wait_until_informed(&self, epoch: EpochId, timeout: Duration) -> EpochId {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = lock(&self.informed_mutex);
        while self.epoch_id_informed.load(Ordering::SeqCst) < epoch {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.cv_informed.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => next,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(guard);
        self.epoch_id_informed.load(Ordering::SeqCst)
    }

    // --------------------------------------------------------------------------------------------
    // Epoch file rotation
    // --------------------------------------------------------------------------------------------

    /// Rotates the active epoch file: the current file is renamed to
    /// `epoch.<unix_millis>.<seq>` and a fresh active file is seeded with
    /// the current durable marker. Returns the rotated file name.
    pub fn rotate_epoch_file(&self) -> Result<PathBuf, EpochError> {
        let mut state = lock(&self.epoch_file);

        self.ops.flush_and_sync(&mut state.file)?;

        state.rotation_seq += 1;
        let rotated_name = format!(
            "{EPOCH_FILE_NAME}.{}.{}",
            unix_millis(),
            state.rotation_seq
        );
        let active_path = self.log_dir.join(EPOCH_FILE_NAME);
        let rotated_path = self.log_dir.join(&rotated_name);
        self.ops.rename(&active_path, &rotated_path)?;

        let mut new_file = self.ops.open_append(&active_path)?;
        let durable = self.epoch_id_record_finished.load(Ordering::SeqCst);
        record::write_record(&mut new_file, &LogRecord::MarkerDurable { epoch: durable })?;
        self.ops.flush_and_sync(&mut new_file)?;
        state.file = new_file;

        info!(rotated = %rotated_path.display(), durable, "epoch file rotated");
        Ok(rotated_path)
    }
}

// ------------------------------------------------------------------------------------------------
// Durable-epoch search (recovery)
// ------------------------------------------------------------------------------------------------

/// Scans the active and rotated epoch files of `log_dir` and returns the
/// maximum durable epoch recorded, or 0 when none exists.
///
/// A torn trailing record (crash mid-append) is tolerated; every complete
/// marker before it counts.
pub fn search_max_durable_epoch(
    log_dir: &Path,
    ops: &dyn FileOps,
) -> Result<EpochId, EpochError> {
    let mut max_epoch = 0;
    for path in ops.list_dir(log_dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name != EPOCH_FILE_NAME && !name.starts_with(&format!("{EPOCH_FILE_NAME}.")) {
            continue;
        }
        if ops.is_dir(&path) {
            continue;
        }

        let file = ops.open_read(&path)?;
        let mut reader = record::RecordReader::new(BufReader::new(file));
        for item in &mut reader {
            match item {
                Ok(LogRecord::MarkerDurable { epoch }) => max_epoch = max_epoch.max(epoch),
                Ok(_) => continue,
                Err(RecordError::TruncatedRecord) => break,
                Err(e) => return Err(EpochError::Record(e)),
            }
        }
    }
    Ok(max_epoch)
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Raises `atomic` to `target` if it is currently lower. Returns true if
/// this call performed the raise.
fn cas_max(atomic: &AtomicU64, target: u64) -> bool {
    let mut current = atomic.load(Ordering::SeqCst);
    while current < target {
        match atomic.compare_exchange_weak(current, target, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

/// Milliseconds since the unix epoch, used in rotated file names.
pub(crate) fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
