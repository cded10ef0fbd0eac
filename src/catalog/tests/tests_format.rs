use std::collections::BTreeSet;

use tempfile::TempDir;

use crate::catalog::{
    CATALOG_BACKUP_NAME, CATALOG_FILE_NAME, CatalogError, CompactedFileInfo, CompactionCatalog,
};
use crate::fileio::StdFileOps;

fn compacted(name: &str, version: u32) -> CompactedFileInfo {
    CompactedFileInfo {
        file_name: name.to_string(),
        version,
    }
}

fn sample_sets() -> (BTreeSet<CompactedFileInfo>, BTreeSet<String>) {
    let files = BTreeSet::from([compacted("pwal_0000.compacted", 1)]);
    let pwals = BTreeSet::from([
        "pwal_0000.1700000000000.0".to_string(),
        "pwal_0001.1700000000000.0".to_string(),
    ]);
    (files, pwals)
}

#[test]
fn test_update_then_load_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;
    let (files, pwals) = sample_sets();

    let mut catalog = CompactionCatalog::new(tmp.path());
    catalog
        .update_catalog_file(42, files.clone(), pwals.clone(), &ops)
        .unwrap();

    let loaded = CompactionCatalog::from_catalog_file(tmp.path(), &ops).unwrap();
    assert_eq!(loaded.max_epoch_id(), 42);
    assert_eq!(loaded.compacted_files(), &files);
    assert_eq!(loaded.detached_pwals(), &pwals);
}

#[test]
fn test_missing_catalog_loads_empty() {
    let tmp = TempDir::new().unwrap();
    let loaded = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap();
    assert_eq!(loaded.max_epoch_id(), 0);
    assert!(loaded.compacted_files().is_empty());
    assert!(loaded.detached_pwals().is_empty());
}

#[test]
fn test_update_keeps_previous_as_backup() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;
    let (files, pwals) = sample_sets();

    let mut catalog = CompactionCatalog::new(tmp.path());
    catalog
        .update_catalog_file(10, BTreeSet::new(), BTreeSet::new(), &ops)
        .unwrap();
    catalog.update_catalog_file(20, files, pwals, &ops).unwrap();

    let backup = std::fs::read_to_string(tmp.path().join(CATALOG_BACKUP_NAME)).unwrap();
    assert!(backup.contains("MAX_EPOCH_ID 10"));
    let primary = std::fs::read_to_string(tmp.path().join(CATALOG_FILE_NAME)).unwrap();
    assert!(primary.contains("MAX_EPOCH_ID 20"));
}

#[test]
fn test_missing_footer_falls_back_to_backup() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;
    let (files, pwals) = sample_sets();

    let mut catalog = CompactionCatalog::new(tmp.path());
    catalog
        .update_catalog_file(10, files, pwals, &ops)
        .unwrap();
    catalog
        .update_catalog_file(20, BTreeSet::new(), BTreeSet::new(), &ops)
        .unwrap();

    // Tear the footer off the primary — simulates a partial write.
    let primary_path = tmp.path().join(CATALOG_FILE_NAME);
    let torn = std::fs::read_to_string(&primary_path)
        .unwrap()
        .replace("COMPACTION_CATALOG_FOOTER\n", "");
    std::fs::write(&primary_path, torn).unwrap();

    let loaded = CompactionCatalog::from_catalog_file(tmp.path(), &ops).unwrap();
    // The backup (epoch 10) was promoted to primary.
    assert_eq!(loaded.max_epoch_id(), 10);
    assert!(!tmp.path().join(CATALOG_BACKUP_NAME).exists());
    let promoted = std::fs::read_to_string(&primary_path).unwrap();
    assert!(promoted.contains("MAX_EPOCH_ID 10"));
}

#[test]
fn test_corrupt_primary_without_backup_fails() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join(CATALOG_FILE_NAME), "garbage\n").unwrap();

    let err = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap_err();
    assert!(matches!(err, CatalogError::Parse(_)));
}

#[test]
fn test_unknown_keyword_is_parse_error() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join(CATALOG_FILE_NAME),
        "COMPACTION_CATALOG_HEADER\nWHATEVER x\nMAX_EPOCH_ID 1\nCOMPACTION_CATALOG_FOOTER\n",
    )
    .unwrap();

    let err = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap_err();
    assert!(matches!(err, CatalogError::Parse(_)));
}

#[test]
fn test_missing_max_epoch_is_parse_error() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join(CATALOG_FILE_NAME),
        "COMPACTION_CATALOG_HEADER\nCOMPACTION_CATALOG_FOOTER\n",
    )
    .unwrap();

    let err = CompactionCatalog::from_catalog_file(tmp.path(), &StdFileOps).unwrap_err();
    assert!(matches!(err, CatalogError::Parse(_)));
}

#[test]
fn test_exact_rendered_layout() {
    let tmp = TempDir::new().unwrap();
    let ops = StdFileOps;
    let (files, pwals) = sample_sets();

    let mut catalog = CompactionCatalog::new(tmp.path());
    catalog.update_catalog_file(7, files, pwals, &ops).unwrap();

    let text = std::fs::read_to_string(tmp.path().join(CATALOG_FILE_NAME)).unwrap();
    assert_eq!(
        text,
        "COMPACTION_CATALOG_HEADER\n\
         COMPACTED_FILE pwal_0000.compacted 1\n\
         DETACHED_PWAL pwal_0000.1700000000000.0\n\
         DETACHED_PWAL pwal_0001.1700000000000.0\n\
         MAX_EPOCH_ID 7\n\
         COMPACTION_CATALOG_FOOTER\n"
    );
}
