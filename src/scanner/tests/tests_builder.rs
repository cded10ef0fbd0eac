use crate::record::{LogRecord, WriteVersion};
use crate::scanner::SnapshotBuilder;

fn put(storage: u64, key: &str, value: &str, major: u64, minor: u64) -> LogRecord {
    LogRecord::NormalEntry {
        storage,
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        write_version: WriteVersion::new(major, minor),
    }
}

fn del(storage: u64, key: &str, major: u64, minor: u64) -> LogRecord {
    LogRecord::RemoveEntry {
        storage,
        key: key.as_bytes().to_vec(),
        write_version: WriteVersion::new(major, minor),
    }
}

fn value_of(rec: &LogRecord) -> &[u8] {
    match rec {
        LogRecord::NormalEntry { value, .. } | LogRecord::NormalWithBlob { value, .. } => value,
        _ => panic!("not a value record"),
    }
}

#[test]
fn test_greatest_write_version_wins() {
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(1, "k", "old", 1, 0));
    builder.apply(put(1, "k", "new", 2, 0));
    builder.apply(put(1, "k", "stale", 1, 5)); // lower major loses despite minor

    let live = builder.finalize();
    assert_eq!(live.len(), 1);
    assert_eq!(value_of(&live[0]), b"new");
}

#[test]
fn test_tombstone_erases_equal_and_older() {
    // remove at the same write version as the put: tombstone wins.
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(1, "k", "v", 3, 1));
    builder.apply(del(1, "k", 3, 1));
    assert!(builder.finalize().is_empty());

    // put strictly newer than the tombstone survives.
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(1, "a", "1", 5, 0));
    builder.apply(del(1, "a", 5, 1));
    builder.apply(put(1, "a", "2", 6, 0));
    let live = builder.finalize();
    assert_eq!(live.len(), 1);
    assert_eq!(value_of(&live[0]), b"2");
}

#[test]
fn test_clear_storage_wipes_at_or_below() {
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(1, "old", "x", 1, 0));
    builder.apply(LogRecord::ClearStorage {
        storage: 1,
        write_version: WriteVersion::new(2, 0),
    });
    builder.apply(put(1, "new", "y", 3, 0));
    builder.apply(put(2, "other", "z", 1, 0)); // different storage untouched

    let live = builder.finalize();
    let keys: Vec<&[u8]> = live
        .iter()
        .map(|r| match r {
            LogRecord::NormalEntry { key, .. } => key.as_slice(),
            _ => panic!(),
        })
        .collect();
    assert_eq!(keys, vec![b"new".as_slice(), b"other".as_slice()]);
}

#[test]
fn test_remove_storage_wipes_like_clear() {
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(7, "k", "v", 4, 0));
    builder.apply(LogRecord::RemoveStorage {
        storage: 7,
        write_version: WriteVersion::new(4, 1),
    });
    assert!(builder.finalize().is_empty());
}

#[test]
fn test_output_is_sorted_by_key_sid() {
    let mut builder = SnapshotBuilder::new();
    builder.apply(put(2, "a", "3", 1, 0));
    builder.apply(put(1, "z", "2", 1, 1));
    builder.apply(put(1, "a", "1", 1, 2));

    let live = builder.finalize();
    let sids: Vec<Vec<u8>> = live.iter().map(|r| r.key_sid().unwrap()).collect();
    let mut sorted = sids.clone();
    sorted.sort();
    assert_eq!(sids, sorted);
}

#[test]
fn test_merge_combines_workers() {
    let mut a = SnapshotBuilder::new();
    a.apply(put(1, "k", "from-a", 1, 0));
    a.apply(put(1, "only-a", "1", 1, 1));

    let mut b = SnapshotBuilder::new();
    b.apply(put(1, "k", "from-b", 2, 0));
    b.apply(LogRecord::NormalWithBlob {
        storage: 1,
        key: b"blob".to_vec(),
        value: b"v".to_vec(),
        write_version: WriteVersion::new(1, 0),
        blob_ids: vec![777],
    });

    a.merge(b);
    assert_eq!(a.max_blob_id(), 777);
    let live = a.finalize();
    assert_eq!(live.len(), 3);
    let k = live
        .iter()
        .find(|r| r.key_sid().unwrap().ends_with(b"k"))
        .unwrap();
    assert_eq!(value_of(k), b"from-b");
}

#[test]
fn test_max_blob_id_tracks_all_applied_records() {
    let mut builder = SnapshotBuilder::new();
    assert_eq!(builder.max_blob_id(), 0);
    builder.apply(LogRecord::NormalWithBlob {
        storage: 1,
        key: b"a".to_vec(),
        value: b"v".to_vec(),
        write_version: WriteVersion::new(1, 0),
        blob_ids: vec![10, 99, 5],
    });
    assert_eq!(builder.max_blob_id(), 99);
}
