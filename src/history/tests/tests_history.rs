use std::sync::Arc;

use tempfile::TempDir;

use crate::fileio::StdFileOps;
use crate::history::{HISTORY_TMP_NAME, HistoryError, RECORD_SIZE, WalHistory};

fn history(dir: &std::path::Path) -> WalHistory {
    WalHistory::new(dir, Arc::new(StdFileOps))
}

#[test]
fn test_list_of_missing_file_is_empty() {
    let tmp = TempDir::new().unwrap();
    assert!(history(tmp.path()).list().unwrap().is_empty());
    assert!(!history(tmp.path()).exists());
}

#[test]
fn test_append_then_list_in_order() {
    let tmp = TempDir::new().unwrap();
    let hist = history(tmp.path());

    hist.append(3).unwrap();
    hist.append(7).unwrap();
    hist.append(11).unwrap();

    let records = hist.list().unwrap();
    let epochs: Vec<u64> = records.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![3, 7, 11]);
    // Identities are random and effectively unique.
    assert_ne!(records[0].identity, records[1].identity);
}

#[test]
fn test_record_is_24_bytes_big_endian() {
    let tmp = TempDir::new().unwrap();
    let hist = history(tmp.path());
    hist.append(0x0102_0304_0506_0708).unwrap();

    let bytes = std::fs::read(hist.file_path()).unwrap();
    assert_eq!(bytes.len(), RECORD_SIZE);
    // Epoch occupies bytes 0..8 in network byte order.
    assert_eq!(
        &bytes[..8],
        &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
    );
}

#[test]
fn test_recover_both_present_drops_tmp() {
    let tmp = TempDir::new().unwrap();
    let hist = history(tmp.path());
    hist.append(1).unwrap();
    std::fs::write(tmp.path().join(HISTORY_TMP_NAME), b"leftover").unwrap();

    hist.check_and_recover().unwrap();
    assert!(!tmp.path().join(HISTORY_TMP_NAME).exists());
    assert_eq!(hist.list().unwrap().len(), 1);
}

#[test]
fn test_recover_tmp_only_promotes() {
    let tmp = TempDir::new().unwrap();
    let hist = history(tmp.path());
    hist.append(5).unwrap();

    // Simulate a crash between fsync of the tmp and the rename.
    std::fs::rename(hist.file_path(), tmp.path().join(HISTORY_TMP_NAME)).unwrap();
    assert!(!hist.exists());

    hist.check_and_recover().unwrap();
    assert!(hist.exists());
    assert_eq!(hist.list().unwrap()[0].epoch, 5);
}

#[test]
fn test_partial_record_is_detected() {
    let tmp = TempDir::new().unwrap();
    let hist = history(tmp.path());
    hist.append(1).unwrap();

    // Append garbage shorter than one record.
    let mut bytes = std::fs::read(hist.file_path()).unwrap();
    bytes.extend_from_slice(&[0xAB; 5]);
    std::fs::write(hist.file_path(), bytes).unwrap();

    let err = hist.list().unwrap_err();
    assert!(matches!(err, HistoryError::PartialRecord));
}
