use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;

use tempfile::TempDir;

use crate::blob::pool::{BlobError, BlobPool};
use crate::blob::resolver::BlobFileResolver;
use crate::fileio::StdFileOps;

struct Fixture {
    resolver: Arc<BlobFileResolver>,
    persistent: Arc<Mutex<BTreeSet<u64>>>,
    pool: BlobPool,
}

fn fixture(dir: &std::path::Path) -> Fixture {
    let resolver = Arc::new(BlobFileResolver::new(dir));
    let persistent = Arc::new(Mutex::new(BTreeSet::new()));
    let pool = BlobPool::new(
        Arc::clone(&resolver),
        Arc::new(StdFileOps),
        Arc::new(AtomicU64::new(0)),
        Arc::clone(&persistent),
    );
    Fixture {
        resolver,
        persistent,
        pool,
    }
}

#[test]
fn test_register_data_creates_blob_file() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    let id = fx.pool.register_data(b"payload").unwrap();
    let path = fx.resolver.resolve_path(id);
    assert_eq!(std::fs::read(&path).unwrap(), b"payload");
}

#[test]
fn test_ids_are_monotonic() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    let a = fx.pool.register_data(b"a").unwrap();
    let b = fx.pool.register_data(b"b").unwrap();
    assert!(b > a);
}

#[test]
fn test_register_file_copy_and_move() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    let copied_src = tmp.path().join("copy-me");
    std::fs::write(&copied_src, b"c").unwrap();
    let id = fx.pool.register_file(&copied_src, false).unwrap();
    assert!(copied_src.exists());
    assert!(fx.resolver.resolve_path(id).exists());

    let moved_src = tmp.path().join("move-me");
    std::fs::write(&moved_src, b"m").unwrap();
    let id = fx.pool.register_file(&moved_src, true).unwrap();
    assert!(!moved_src.exists());
    assert!(fx.resolver.resolve_path(id).exists());
}

#[test]
fn test_register_missing_source_is_blob_error() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    let err = fx
        .pool
        .register_file(&tmp.path().join("ghost"), false)
        .unwrap_err();
    assert!(matches!(err, BlobError::SourceNotFound(_)));
}

#[test]
fn test_release_discards_unpersisted_blobs() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    let keep = fx.pool.register_data(b"keep").unwrap();
    let drop_id = fx.pool.register_data(b"drop").unwrap();
    fx.persistent.lock().unwrap().insert(keep);

    fx.pool.release();
    assert!(fx.resolver.resolve_path(keep).exists());
    assert!(!fx.resolver.resolve_path(drop_id).exists());
    // Confirmed ids leave the pending persistent set.
    assert!(fx.persistent.lock().unwrap().is_empty());
}

#[test]
fn test_use_after_release_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());

    fx.pool.release();
    let err = fx.pool.register_data(b"x").unwrap_err();
    assert!(matches!(err, BlobError::Released));
}

#[test]
fn test_release_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(tmp.path());
    fx.pool.register_data(b"x").unwrap();
    fx.pool.release();
    fx.pool.release();
}
