use tempfile::TempDir;

use super::helpers;
use crate::record::WriteVersion;

#[test]
fn test_write_restart_read_roundtrip() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();

        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"k1", b"v1", 0).unwrap();
        session.add_entry(1, b"k2", b"v2", 1).unwrap();
        session.end().unwrap();

        // Entries of epoch 1 become durable when epoch 2 begins.
        ds.switch_epoch(2).unwrap();
        assert_eq!(ds.last_epoch(), 1);
        ds.shutdown().wait();
    }

    let ds = helpers::open(tmp.path());
    assert_eq!(ds.last_epoch(), 1);
    ds.ready().unwrap();
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![
            (1, b"k1".to_vec(), b"v1".to_vec()),
            (1, b"k2".to_vec(), b"v2".to_vec()),
        ]
    );
}

#[test]
fn test_undurable_epoch_is_not_recovered() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"durable", b"1", 0).unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();

        // Epoch 2 never becomes durable (no later switch).
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"volatile", b"2", 0).unwrap();
        session.end().unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    let entries = helpers::collect_entries(&ds);
    assert_eq!(entries, vec![(1, b"durable".to_vec(), b"1".to_vec())]);
}

#[test]
fn test_tombstone_then_rewrite_yields_latest() {
    // write a=1 at ⟨5,0⟩, remove at ⟨5,1⟩, write a=2 at ⟨6,0⟩ → cursor
    // yields a=2.
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        for epoch in 1..=5 {
            ds.switch_epoch(epoch).unwrap();
        }

        let mut session = channels[0].begin_session().unwrap();
        assert_eq!(session.epoch(), 5);
        session.add_entry(1, b"a", b"1", 0).unwrap();
        session.remove_entry(1, b"a", 1).unwrap();
        session.end().unwrap();

        ds.switch_epoch(6).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"a", b"2", 0).unwrap();
        session.end().unwrap();

        ds.switch_epoch(7).unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![(1, b"a".to_vec(), b"2".to_vec())]
    );
}

#[test]
fn test_tombstoned_key_stays_gone() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(1, b"a", b"1", 0).unwrap();
        session.remove_entry(1, b"a", 1).unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    assert!(helpers::collect_entries(&ds).is_empty());
}

#[test]
fn test_multi_channel_merge_by_write_version() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 2);
        ds.switch_epoch(1).unwrap();

        let mut a = channels[0].begin_session().unwrap();
        a.add_entry(1, b"k", b"from-a", 0).unwrap();
        a.end().unwrap();

        ds.switch_epoch(2).unwrap();
        let mut b = channels[1].begin_session().unwrap();
        b.add_entry(1, b"k", b"from-b", 0).unwrap();
        b.end().unwrap();

        ds.switch_epoch(3).unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![(1, b"k".to_vec(), b"from-b".to_vec())]
    );
}

#[test]
fn test_clear_storage_recovery() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.add_entry(7, b"a", b"1", 0).unwrap();
        session.add_entry(8, b"b", b"2", 1).unwrap();
        session.end().unwrap();

        ds.switch_epoch(2).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session.clear_storage(7, 0).unwrap();
        session.end().unwrap();

        ds.switch_epoch(3).unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    assert_eq!(
        helpers::collect_entries(&ds),
        vec![(8, b"b".to_vec(), b"2".to_vec())]
    );
}

#[test]
fn test_blob_references_survive_recovery() {
    let tmp = TempDir::new().unwrap();
    {
        let (ds, channels) = helpers::open_ready(tmp.path(), 1);
        ds.switch_epoch(1).unwrap();
        let mut session = channels[0].begin_session().unwrap();
        session
            .add_entry_with_blobs(1, b"k", b"v", 0, vec![1001, 1002])
            .unwrap();
        session.end().unwrap();
        ds.switch_epoch(2).unwrap();
    }

    let ds = helpers::open(tmp.path());
    ds.ready().unwrap();
    let mut cursor = ds.snapshot().unwrap();
    let entry = cursor.next().unwrap().unwrap();
    assert_eq!(entry.blob_ids, vec![1001, 1002]);
    assert_eq!(entry.write_version, WriteVersion::new(1, 0));

    // The next allocated blob id is beyond every recovered reference.
    let pool = ds.acquire_blob_pool();
    let fresh = pool.register_data(b"x").unwrap();
    assert!(fresh > 1002);
}
