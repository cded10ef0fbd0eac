use std::sync::Arc;

use tempfile::TempDir;

use crate::epoch::{self, EPOCH_FILE_NAME, EpochCoordinator};
use crate::fileio::StdFileOps;

fn coordinator(dir: &std::path::Path) -> EpochCoordinator {
    EpochCoordinator::new(dir, 0, Arc::new(StdFileOps)).unwrap()
}

#[test]
fn test_durable_markers_land_in_epoch_file() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path());
    for epoch in 1..=4 {
        coord.switch_epoch(epoch).unwrap();
    }
    drop(coord);

    let max = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(max, 3);
}

#[test]
fn test_search_empty_directory_is_zero() {
    let tmp = TempDir::new().unwrap();
    assert_eq!(
        epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap(),
        0
    );
}

#[test]
fn test_rotation_preserves_durable_epoch() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path());
    for epoch in 1..=6 {
        coord.switch_epoch(epoch).unwrap();
    }

    let rotated = coord.rotate_epoch_file().unwrap();
    assert!(rotated.exists());
    let rotated_name = rotated.file_name().unwrap().to_string_lossy().into_owned();
    assert!(rotated_name.starts_with("epoch."));

    // The fresh active file carries the durable marker forward.
    let max = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(max, 5);

    // Durability continues across the rotation.
    coord.switch_epoch(7).unwrap();
    drop(coord);
    let max = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(max, 6);
}

#[test]
fn test_search_covers_rotated_files() {
    let tmp = TempDir::new().unwrap();
    {
        let coord = coordinator(tmp.path());
        for epoch in 1..=4 {
            coord.switch_epoch(epoch).unwrap();
        }
        coord.rotate_epoch_file().unwrap();
    }
    // Remove the active file: the rotated file alone must still answer.
    std::fs::remove_file(tmp.path().join(EPOCH_FILE_NAME)).unwrap();

    let max = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(max, 3);
}

#[test]
fn test_torn_trailing_marker_is_tolerated() {
    let tmp = TempDir::new().unwrap();
    {
        let coord = coordinator(tmp.path());
        for epoch in 1..=3 {
            coord.switch_epoch(epoch).unwrap();
        }
    }

    // Append half a record to the epoch file.
    let path = tmp.path().join(EPOCH_FILE_NAME);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0x09, 0x00, 0x00, 0x00, 0x43]);
    std::fs::write(&path, bytes).unwrap();

    let max = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(max, 2);
}

#[test]
fn test_restart_resumes_from_found_epoch() {
    let tmp = TempDir::new().unwrap();
    {
        let coord = coordinator(tmp.path());
        for epoch in 1..=5 {
            coord.switch_epoch(epoch).unwrap();
        }
    }

    let last = epoch::search_max_durable_epoch(tmp.path(), &StdFileOps).unwrap();
    let coord = EpochCoordinator::new(tmp.path(), last, Arc::new(StdFileOps)).unwrap();
    assert_eq!(coord.durable_epoch(), 4);

    // Epochs stay monotonic across the restart.
    assert!(coord.switch_epoch(3).is_err());
    coord.switch_epoch(5).unwrap();
    assert_eq!(coord.durable_epoch(), 4);
}
