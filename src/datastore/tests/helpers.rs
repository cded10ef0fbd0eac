use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::datastore::{Datastore, DatastoreConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opens a datastore over `dir` with test-friendly parallelism.
pub fn open(dir: &Path) -> Datastore {
    init_tracing();
    Datastore::open(DatastoreConfig {
        log_dir: dir.to_path_buf(),
        recover_max_parallelism: 2,
    })
    .unwrap()
}

/// Opens and readies a datastore with `channels` log channels.
pub fn open_ready(
    dir: &Path,
    channels: usize,
) -> (Datastore, Vec<std::sync::Arc<crate::channel::LogChannel>>) {
    let ds = open(dir);
    let chans = (0..channels).map(|_| ds.create_channel().unwrap()).collect();
    ds.ready().unwrap();
    (ds, chans)
}

/// Collects (storage, key, value) triples from the datastore cursor.
pub fn collect_entries(ds: &Datastore) -> Vec<(u64, Vec<u8>, Vec<u8>)> {
    let mut cursor = ds.snapshot().unwrap();
    let mut out = Vec::new();
    while let Some(entry) = cursor.next().unwrap() {
        out.push((entry.storage, entry.key, entry.value));
    }
    out
}
