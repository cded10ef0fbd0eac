use tempfile::TempDir;

use super::helpers;
use crate::catalog::CompactionCatalog;
use crate::compaction::COMPACTED_FILE_NAME;
use crate::fileio::StdFileOps;

fn make_blob(ds: &crate::datastore::Datastore, id: u64) {
    let path = ds.blob_file_path(id);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"blob").unwrap();
}

#[test]
fn test_online_compaction_with_blob_gc() {
    // Epoch 1: k1 (blobs 1001, 1002), k2 (blob 1003). Epoch 2: k1
    // rewritten with blobs 2001, 2002. Compact at epoch 3: k1 and k2
    // survive, blobs 1001/1002 are collected, 1003/2001/2002 stay.
    let tmp = TempDir::new().unwrap();
    let (ds, channels) = helpers::open_ready(tmp.path(), 2);

    for id in [1001, 1002, 1003, 2001, 2002] {
        make_blob(&ds, id);
    }

    ds.switch_epoch(1).unwrap();
    let mut session = channels[0].begin_session().unwrap();
    session
        .add_entry_with_blobs(1, b"k1", b"v1", 0, vec![1001, 1002])
        .unwrap();
    session
        .add_entry_with_blobs(1, b"k2", b"v2", 1, vec![1003])
        .unwrap();
    session.end().unwrap();

    ds.switch_epoch(2).unwrap();
    let mut session = channels[0].begin_session().unwrap();
    session
        .add_entry_with_blobs(1, b"k1", b"v1'", 0, vec![2001, 2002])
        .unwrap();
    session.end().unwrap();

    ds.switch_epoch(3).unwrap();
    ds.compact_with_online().unwrap();
    ds.wait_for_blob_gc();

    // Compacted image: k1 → v1' (2001, 2002), k2 → v2 (1003).
    let catalog = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(catalog.max_epoch_id(), 2);
    assert_eq!(catalog.compacted_files().len(), 1);

    let mut cursor = crate::snapshot::SnapshotCursor::open(&tmp.path().join(COMPACTED_FILE_NAME))
        .unwrap();
    let k1 = cursor.next().unwrap().unwrap();
    assert_eq!(k1.key, b"k1");
    assert_eq!(k1.value, b"v1'");
    assert_eq!(k1.blob_ids, vec![2001, 2002]);
    let k2 = cursor.next().unwrap().unwrap();
    assert_eq!(k2.key, b"k2");
    assert_eq!(k2.blob_ids, vec![1003]);
    assert!(cursor.next().unwrap().is_none());

    // GC: superseded blobs gone, referenced blobs retained.
    assert!(!ds.blob_file_path(1001).exists());
    assert!(!ds.blob_file_path(1002).exists());
    assert!(ds.blob_file_path(1003).exists());
    assert!(ds.blob_file_path(2001).exists());
    assert!(ds.blob_file_path(2002).exists());
}

#[test]
fn test_compaction_detaches_rotated_files() {
    let tmp = TempDir::new().unwrap();
    let (ds, channels) = helpers::open_ready(tmp.path(), 1);

    ds.switch_epoch(1).unwrap();
    let mut session = channels[0].begin_session().unwrap();
    session.add_entry(1, b"k", b"v", 0).unwrap();
    session.end().unwrap();
    ds.switch_epoch(2).unwrap();

    ds.compact_with_online().unwrap();
    ds.wait_for_blob_gc();

    let catalog = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(catalog.detached_pwals().len(), 1);
    let detached = catalog.detached_pwals().iter().next().unwrap().clone();
    assert!(detached.starts_with("pwal_0000."));
}

#[test]
fn test_recovery_after_compaction_merges_base_and_residual() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"base", b"1", 0).unwrap();
        session.add_entry(1, b"both", b"old", 1).unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();
        ds.compact_with_online().unwrap();
        ds.wait_for_blob_gc();

        // Residual writes after compaction.
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"both", b"new", 0).unwrap();
        session.add_entry(1, b"tail", b"2", 1).unwrap();
        session.end().unwrap();
        ds.switch_epoch(3).unwrap();
        ds.shutdown().wait();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![
            (1, b"base".to_vec(), b"1".to_vec()),
            (1, b"both".to_vec(), b"new".to_vec()),
            (1, b"tail".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn test_tombstone_after_compaction_shadows_base() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"doomed", b"v", 0).unwrap();
        session.add_entry(1, b"kept", b"v", 1).unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();
        ds.compact_with_online().unwrap();
        ds.wait_for_blob_gc();

        // Delete after the key moved into the compacted base.
        let mut session = channels[0].begin_session().unwrap();
        session.remove_entry(1, b"doomed", 0).unwrap();
        session.end().unwrap();
        ds.switch_epoch(3).unwrap();
        ds.shutdown().wait();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    // The base entry must not resurface past the newer tombstone.
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![(1, b"kept".to_vec(), b"v".to_vec())]
    );
}

#[test]
fn test_clear_storage_after_compaction_shadows_base() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(5, b"a", b"1", 0).unwrap();
        session.add_entry(5, b"b", b"2", 1).unwrap();
        session.add_entry(6, b"c", b"3", 2).unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();
        ds.compact_with_online().unwrap();
        ds.wait_for_blob_gc();

        let mut session = channels[0].begin_session().unwrap();
        session.clear_storage(5, 0).unwrap();
        session.end().unwrap();
        ds.switch_epoch(3).unwrap();
        ds.shutdown().wait();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    // Storage 5 was wiped after its keys entered the base.
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![(6, b"c".to_vec(), b"3".to_vec())]
    );
}

#[test]
fn test_compaction_without_writes_is_noop() {
    let tmp = TempDir::new().unwrap();
    let (ds, _channels) = helpers::open_ready(tmp.path(), 1);
    ds.switch_epoch(1).unwrap();
    ds.compact_with_online().unwrap();
    assert!(!tmp.path().join(COMPACTED_FILE_NAME).exists());
}

#[test]
fn test_repeated_compaction_reproduces_bytes() {
    let tmp = TempDir::new().unwrap();
    let (ds, channels) = helpers::open_ready(tmp.path(), 1);

    ds.switch_epoch(1).unwrap();
    let mut session = channels[0].begin_session().unwrap();
    session.add_entry(1, b"a", b"1", 0).unwrap();
    session.add_entry(2, b"b", b"2", 1).unwrap();
    session.end().unwrap();
    ds.switch_epoch(2).unwrap();

    ds.compact_with_online().unwrap();
    ds.wait_for_blob_gc();
    let first = std::fs::read(tmp.path().join(COMPACTED_FILE_NAME)).unwrap();

    ds.compact_with_online().unwrap();
    ds.wait_for_blob_gc();
    let second = std::fs::read(tmp.path().join(COMPACTED_FILE_NAME)).unwrap();
    assert_eq!(first, second);
}
