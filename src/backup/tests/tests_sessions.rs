use std::time::Duration;

use tempfile::TempDir;

use crate::backup::{
    BackupError, BackupObject, BackupSessionManager, EpochBounds,
};
use crate::fileio::StdFileOps;

fn bounds() -> EpochBounds {
    EpochBounds {
        snapshot_epoch: 10,
        current_epoch: 44,
        boot_durable_epoch: 20,
    }
}

fn manager() -> BackupSessionManager {
    BackupSessionManager::new(Duration::from_secs(60), 8)
}

fn objects(dir: &std::path::Path) -> Vec<BackupObject> {
    let path = dir.join("pwal_0000.1.1");
    std::fs::write(&path, b"0123456789abcdef0123").unwrap(); // 20 bytes
    vec![BackupObject {
        id: "pwal_0000.1.1".to_string(),
        path,
    }]
}

#[test]
fn test_begin_backup_issues_unique_tokens() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager();

    let a = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();
    let b = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();
    assert_ne!(a.token, b.token);
    assert_eq!(mgr.live_sessions(), 2);
}

#[test]
fn test_epoch_range_validation() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager();
    let objs = objects(tmp.path());

    // begin must be below end.
    assert!(matches!(
        mgr.begin_backup(30, 30, bounds(), objs.clone()),
        Err(BackupError::InvalidRange(_))
    ));
    // begin must be above the snapshot epoch.
    assert!(matches!(
        mgr.begin_backup(10, 44, bounds(), objs.clone()),
        Err(BackupError::InvalidRange(_))
    ));
    // end must not exceed the current epoch.
    assert!(matches!(
        mgr.begin_backup(11, 45, bounds(), objs.clone()),
        Err(BackupError::InvalidRange(_))
    ));
    // end must be above the boot durable epoch.
    assert!(matches!(
        mgr.begin_backup(11, 20, bounds(), objs),
        Err(BackupError::InvalidRange(_))
    ));
}

#[test]
fn test_keep_alive_extends_expiry() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager();
    let session = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();

    let extended = mgr.keep_alive(&session.token).unwrap();
    assert!(extended >= session.expire_at);

    assert!(matches!(
        mgr.keep_alive("no-such-token"),
        Err(BackupError::UnknownSession(_))
    ));
}

#[test]
fn test_expired_session_is_gone() {
    let tmp = TempDir::new().unwrap();
    let mgr = BackupSessionManager::new(Duration::from_millis(10), 8);
    let session = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(matches!(
        mgr.keep_alive(&session.token),
        Err(BackupError::UnknownSession(_))
    ));
    assert_eq!(mgr.live_sessions(), 0);
}

#[test]
fn test_get_object_streams_chunks() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(); // chunk size 8
    let session = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();

    let chunks = mgr
        .get_object(
            &session.token,
            &["pwal_0000.1.1".to_string()],
            &StdFileOps,
        )
        .unwrap();

    // 20 bytes in 8-byte chunks: 8 + 8 + 4.
    assert_eq!(chunks.len(), 3);
    assert!(chunks[0].is_first && !chunks[0].is_last);
    assert!(!chunks[1].is_first && !chunks[1].is_last);
    assert!(!chunks[2].is_first && chunks[2].is_last);
    assert_eq!(chunks[0].offset, 0);
    assert_eq!(chunks[1].offset, 8);
    assert_eq!(chunks[2].offset, 16);
    assert!(chunks.iter().all(|c| c.total_size == 20));

    let reassembled: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
    assert_eq!(reassembled, b"0123456789abcdef0123");
}

#[test]
fn test_get_object_unknown_id() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager();
    let session = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();

    let err = mgr
        .get_object(&session.token, &["ghost".to_string()], &StdFileOps)
        .unwrap_err();
    assert!(matches!(err, BackupError::UnknownObject(_)));
}

#[test]
fn test_end_backup_is_idempotent_for_unknown_tokens() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager();
    let session = mgr.begin_backup(11, 44, bounds(), objects(tmp.path())).unwrap();

    mgr.end_backup(&session.token);
    assert_eq!(mgr.live_sessions(), 0);
    // No-op, no panic, no error.
    mgr.end_backup(&session.token);
    mgr.end_backup("never-existed");
}
