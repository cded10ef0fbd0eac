//! # Tidelog
//!
//! An embeddable **write-ahead log engine** with epoch-based durability,
//! online compaction, and BLOB lifecycle management. Tidelog is the
//! persistence core of a transactional database: it durably records
//! ordered key/value mutations, large binary objects, and
//! storage-lifecycle events; periodically compacts its on-disk
//! representation; supplies a consistent point-in-time snapshot for crash
//! recovery; and supports online backup/restore and WAL replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Datastore                           │
//! │  ┌───────────┐  ┌───────────┐        ┌─────────────────┐   │
//! │  │ Channel 0 │  │ Channel N │  ...   │ Epoch            │   │
//! │  │ pwal_0000 │  │ pwal_000n │        │ Coordinator      │   │
//! │  └─────┬─────┘  └─────┬─────┘        │ (4 watermarks)   │   │
//! │        │ rotate       │ rotate       └───────┬─────────┘   │
//! │        ▼              ▼                      ▼             │
//! │   rotated WAL files ────────────────►  epoch file          │
//! │        │                                                   │
//! │        │ compact                    ┌──────────────────┐   │
//! │        ▼                            │ BLOB store + GC  │   │
//! │   compacted file + catalog ────────►│ blob/dir_NN/*.blob│  │
//! │        │                            └──────────────────┘   │
//! │        ▼ recover                                           │
//! │   data/snapshot ──► SnapshotCursor (merged ordered view)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`datastore`] | Root entity — open, ready, channels, compaction, backup, shutdown |
//! | [`channel`] | Per-channel append sessions bracketed by epoch markers |
//! | [`epoch`] | Four-watermark epoch coordinator and the epoch file |
//! | [`record`] | Log entry tagged union and CRC-framed record format |
//! | [`encoding`] | Deterministic binary encoding for on-disk records |
//! | [`scanner`] | Recovery scan and snapshot materialization |
//! | [`snapshot`] | Merged, ordered, tombstone-free cursor over the recovery image |
//! | [`compaction`] | Rotated-WAL merge into the compacted file |
//! | [`catalog`] | Textual compaction catalog with backup fallback |
//! | [`manifest`] | JSON manifest, format migration, single-writer lock |
//! | [`history`] | WAL rotation history for replica compatibility checks |
//! | [`blob`] | BLOB resolver, registration pool, GC state machine + collector |
//! | [`backup`] | Backup file sets, restore, remote backup sessions |
//! | [`wire`] | Big-endian replication envelope and replica server |
//! | [`fileio`] | Narrow injectable filesystem abstraction |
//!
//! ## Key Guarantees
//!
//! - **Epoch durability** — `marker_durable(e)` in the epoch file means
//!   every entry with major ≤ e is on stable storage; the advertised
//!   durable epoch never overtakes the slowest in-flight writer.
//! - **Write-version reconciliation** — for a (storage, key), the record
//!   with the greatest ⟨major, minor⟩ is authoritative; tombstones erase
//!   prior and equal-or-older versions.
//! - **Crash recovery** — only sessions closed by `marker_end` count;
//!   invalidated and torn regions are discarded; recovery stops at the
//!   last durable epoch.
//! - **Atomic metadata** — manifest, catalog, WAL history, and the
//!   compacted file are all replaced via write-temp-then-rename with a
//!   backup copy for torn writes.
//! - **Best-effort BLOB GC** — never deletes a referenced BLOB nor one
//!   newer than the scan ceiling; misuse of the GC state machine is a
//!   logic error, not a race.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidelog::datastore::{Datastore, DatastoreConfig};
//!
//! let ds = Datastore::open(DatastoreConfig::new("/var/lib/mydb/log")).unwrap();
//! let channel = ds.create_channel().unwrap();
//! ds.ready().unwrap();
//!
//! ds.switch_epoch(1).unwrap();
//! let mut session = channel.begin_session().unwrap();
//! session.add_entry(1, b"hello", b"world", 0).unwrap();
//! session.end().unwrap();
//!
//! // Epoch 1 becomes durable once the datastore moves past it.
//! ds.switch_epoch(2).unwrap();
//! assert_eq!(ds.last_epoch(), 1);
//!
//! ds.shutdown().wait();
//! ```

pub mod backup;
pub mod blob;
pub mod catalog;
pub mod channel;
pub mod compaction;
pub mod datastore;
pub mod encoding;
pub mod epoch;
pub mod fileio;
pub mod history;
pub mod manifest;
pub mod record;
pub mod scanner;
pub mod snapshot;
pub mod wire;

pub use datastore::{Datastore, DatastoreConfig, DatastoreError, ShutdownHandle};
pub use record::{BlobId, EpochId, LogRecord, StorageId, WriteVersion};
pub use snapshot::{SnapshotCursor, SnapshotEntry};
