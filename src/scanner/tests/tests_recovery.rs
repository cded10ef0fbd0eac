use std::path::Path;

use tempfile::TempDir;

use crate::catalog::CompactionCatalog;
use crate::fileio::StdFileOps;
use crate::record::{self, LogRecord, WriteVersion};
use crate::scanner::{self, RecoveryError, SnapshotBuilder};
use crate::snapshot::SnapshotCursor;

fn frame(records: &[LogRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for rec in records {
        record::write_record(&mut buf, rec).unwrap();
    }
    buf
}

fn session(epoch: u64, body: &[LogRecord]) -> Vec<LogRecord> {
    let mut records = vec![LogRecord::MarkerBegin { epoch }];
    records.extend_from_slice(body);
    records.push(LogRecord::MarkerEnd { epoch });
    records
}

fn put(storage: u64, key: &str, value: &str, major: u64, minor: u64) -> LogRecord {
    LogRecord::NormalEntry {
        storage,
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        write_version: WriteVersion::new(major, minor),
    }
}

fn scan_one(path: &Path, ceiling: u64) -> Result<SnapshotBuilder, RecoveryError> {
    let mut builder = SnapshotBuilder::new();
    scanner::scan_wal_file_into(path, ceiling, &mut builder)?;
    Ok(builder)
}

#[test]
fn test_complete_sessions_are_applied() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut records = session(1, &[put(1, "a", "1", 1, 0)]);
    records.extend(session(2, &[put(1, "b", "2", 2, 0)]));
    std::fs::write(&wal, frame(&records)).unwrap();

    let builder = scan_one(&wal, 10).unwrap();
    assert_eq!(builder.finalize().len(), 2);
}

#[test]
fn test_sessions_beyond_ceiling_are_dropped() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut records = session(1, &[put(1, "durable", "1", 1, 0)]);
    records.extend(session(5, &[put(1, "volatile", "2", 5, 0)]));
    std::fs::write(&wal, frame(&records)).unwrap();

    let live = scan_one(&wal, 1).unwrap().finalize();
    assert_eq!(live.len(), 1);
    assert!(live[0].key_sid().unwrap().ends_with(b"durable"));
}

#[test]
fn test_invalidated_region_is_discarded() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut records = vec![
        LogRecord::MarkerBegin { epoch: 1 },
        put(1, "ghost", "x", 1, 0),
        LogRecord::MarkerInvalidatedBegin { epoch: 1 },
    ];
    records.extend(session(2, &[put(1, "real", "y", 2, 0)]));
    std::fs::write(&wal, frame(&records)).unwrap();

    let live = scan_one(&wal, 10).unwrap().finalize();
    assert_eq!(live.len(), 1);
    assert!(live[0].key_sid().unwrap().ends_with(b"real"));
}

#[test]
fn test_unclosed_trailing_session_is_discarded() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut records = session(1, &[put(1, "committed", "1", 1, 0)]);
    records.push(LogRecord::MarkerBegin { epoch: 2 });
    records.push(put(1, "torn", "2", 2, 0));
    std::fs::write(&wal, frame(&records)).unwrap();

    let live = scan_one(&wal, 10).unwrap().finalize();
    assert_eq!(live.len(), 1);
    assert!(live[0].key_sid().unwrap().ends_with(b"committed"));
}

#[test]
fn test_torn_trailing_bytes_after_end_are_tolerated() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut bytes = frame(&session(1, &[put(1, "k", "v", 1, 0)]));
    bytes.extend_from_slice(&[0x40, 0x00, 0x00, 0x00, 0x41, 0x02]); // half a frame
    std::fs::write(&wal, bytes).unwrap();

    let live = scan_one(&wal, 10).unwrap().finalize();
    assert_eq!(live.len(), 1);
}

#[test]
fn test_mid_file_corruption_aborts() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    let mut bytes = frame(&session(1, &[put(1, "k", "v", 1, 0)]));
    let tail = frame(&session(2, &[put(1, "x", "y", 2, 0)]));
    let corrupt_at = bytes.len() + 6;
    bytes.extend_from_slice(&tail);
    bytes[corrupt_at] ^= 0xFF;
    std::fs::write(&wal, bytes).unwrap();

    let err = scan_one(&wal, 10).unwrap_err();
    assert!(matches!(err, RecoveryError::Record { .. }));
}

#[test]
fn test_data_entry_outside_session_is_malformed() {
    let tmp = TempDir::new().unwrap();
    let wal = tmp.path().join("pwal_0000");
    std::fs::write(&wal, frame(&[put(1, "k", "v", 1, 0)])).unwrap();

    let err = scan_one(&wal, 10).unwrap_err();
    assert!(matches!(err, RecoveryError::Malformed { .. }));
}

#[test]
fn test_build_snapshot_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;

    // Two channels, overlapping keys, one tombstone, one blob entry.
    let mut ch0 = session(
        1,
        &[
            put(1, "a", "old", 1, 0),
            LogRecord::NormalWithBlob {
                storage: 1,
                key: b"blob".to_vec(),
                value: b"v".to_vec(),
                write_version: WriteVersion::new(1, 1),
                blob_ids: vec![1003],
            },
        ],
    );
    ch0.extend(session(2, &[put(1, "a", "new", 2, 0)]));
    std::fs::write(tmp.path().join("pwal_0000"), frame(&ch0)).unwrap();

    let ch1 = session(
        2,
        &[
            put(1, "b", "1", 2, 0),
            LogRecord::RemoveEntry {
                storage: 1,
                key: b"b".to_vec(),
                write_version: WriteVersion::new(2, 1),
            },
        ],
    );
    std::fs::write(tmp.path().join("pwal_0001.1700000000000.1"), frame(&ch1)).unwrap();

    let catalog = CompactionCatalog::new(tmp.path());
    let image = scanner::build_snapshot(tmp.path(), &catalog, 10, 4, &ops).unwrap();
    assert_eq!(image.entry_count, 2); // "a" and "blob"; "b" tombstoned
    assert_eq!(image.max_blob_id, 1003);

    let mut cursor = SnapshotCursor::open(&image.snapshot_path).unwrap();
    let first = cursor.next().unwrap().unwrap();
    assert_eq!(first.key, b"a");
    assert_eq!(first.value, b"new");
    let second = cursor.next().unwrap().unwrap();
    assert_eq!(second.key, b"blob");
    assert_eq!(second.blob_ids, vec![1003]);
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn test_recovery_truncates_non_durable_tail() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;

    let mut records = session(1, &[put(1, "durable", "1", 1, 0)]);
    let durable_len = frame(&records).len() as u64;
    records.extend(session(5, &[put(1, "volatile", "2", 5, 0)]));
    let wal = tmp.path().join("pwal_0000");
    std::fs::write(&wal, frame(&records)).unwrap();

    let catalog = CompactionCatalog::new(tmp.path());
    let image = scanner::build_snapshot(tmp.path(), &catalog, 1, 1, &ops).unwrap();
    assert_eq!(image.entry_count, 1);

    // The non-durable epoch-5 session is gone from the file: a later
    // reuse of epoch 5 cannot make it reappear.
    assert_eq!(std::fs::metadata(&wal).unwrap().len(), durable_len);
}

#[test]
fn test_detached_pwals_are_excluded() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;

    let detached_name = "pwal_0000.1700000000000.1";
    std::fs::write(
        tmp.path().join(detached_name),
        frame(&session(1, &[put(1, "stale", "x", 1, 0)])),
    )
    .unwrap();
    std::fs::write(
        tmp.path().join("pwal_0000"),
        frame(&session(2, &[put(1, "fresh", "y", 2, 0)])),
    )
    .unwrap();

    let mut catalog = CompactionCatalog::new(tmp.path());
    catalog
        .update_catalog_file(
            1,
            Default::default(),
            [detached_name.to_string()].into_iter().collect(),
            &ops,
        )
        .unwrap();

    let files = scanner::collect_wal_files(tmp.path(), &catalog, &ops).unwrap();
    assert_eq!(files, vec![tmp.path().join("pwal_0000")]);
}

#[test]
fn test_compacted_and_tmp_artifacts_are_not_wal_input() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;

    std::fs::write(
        tmp.path().join("pwal_0000"),
        frame(&session(1, &[put(1, "k", "v", 1, 0)])),
    )
    .unwrap();
    // A compacted file and an in-flight replacement left by a crash.
    std::fs::write(tmp.path().join("pwal_0000.compacted"), b"not-wal").unwrap();
    std::fs::write(tmp.path().join("pwal_0000.compacted.tmp"), b"torn").unwrap();

    let catalog = CompactionCatalog::new(tmp.path());
    let files = scanner::collect_wal_files(tmp.path(), &catalog, &ops).unwrap();
    assert_eq!(files, vec![tmp.path().join("pwal_0000")]);
}
