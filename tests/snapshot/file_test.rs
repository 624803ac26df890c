// Snapshot File Tests
// Tests for parsing, validating and exporting snapshot files

use std::fs;
use tanglestore::convert::{Hash, PACKED_LEN};
use tanglestore::snapshot::file::{
    self, SnapshotContents, SnapshotFileError, SnapshotReader, SnapshotRecord,
};
use tempfile::TempDir;

fn id(byte: u8) -> Hash {
    Hash::from_bytes([byte; PACKED_LEN])
}

fn parse(text: &str) -> Vec<Result<SnapshotRecord, SnapshotFileError>> {
    SnapshotReader::new(std::io::Cursor::new(text.to_string())).collect()
}

// ============================================================================
// PARSING
// ============================================================================

#[test]
fn test_parse_all_sections() {
    let text = format!(
        "{};100\n  {};0  \n===\n{}\n===\n{}\n",
        id(1),
        id(2),
        id(3),
        id(4)
    );

    let records: Vec<SnapshotRecord> = parse(&text).into_iter().map(Result::unwrap).collect();

    assert_eq!(
        records,
        vec![
            SnapshotRecord::Balance { address: id(1), value: 100 },
            SnapshotRecord::Balance { address: id(2), value: 0 },
            SnapshotRecord::Spent(id(3)),
            SnapshotRecord::PendingBundle(id(4)),
        ]
    );
}

#[test]
fn test_blank_lines_are_skipped() {
    let text = format!("\n{};1\n\n===\n\n", id(1));
    assert_eq!(parse(&text).len(), 1);
}

#[test]
fn test_balance_without_value_is_rejected() {
    let records = parse(&format!("{}\n===\n", id(1)));
    assert!(matches!(
        records[0],
        Err(SnapshotFileError::Format { line: 1, .. })
    ));
}

#[test]
fn test_bad_trytes_are_rejected() {
    let records = parse("ABC;10\n");
    assert!(matches!(records[0], Err(SnapshotFileError::Format { .. })));

    let records = parse(&format!("{};10\n===\nabc\n", id(1)));
    assert!(matches!(
        records[1],
        Err(SnapshotFileError::Format { line: 3, .. })
    ));
}

#[test]
fn test_fourth_section_is_rejected() {
    let records = parse("===\n===\n===\n");
    assert!(matches!(records[0], Err(SnapshotFileError::Format { .. })));
}

// ============================================================================
// FILES
// ============================================================================

#[test]
fn test_validate_counts_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("1000.snap");
    fs::write(
        &path,
        format!("{};70\n{};30\n===\n{}\n", id(1), id(2), id(1)),
    )
    .unwrap();

    let summary = file::validate_file(&path).unwrap();

    assert_eq!(summary.balances, 2);
    assert_eq!(summary.spent, 1);
    assert_eq!(summary.pending_bundles, 0);
    assert_eq!(summary.total_value, 100);
}

#[test]
fn test_validate_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = file::validate_file(&dir.path().join("1.snap"));
    assert!(matches!(result, Err(SnapshotFileError::Io(_))));
}

#[test]
fn test_write_then_validate() {
    let dir = TempDir::new().unwrap();
    let mut contents = SnapshotContents::default();
    contents.balances.insert(id(1), 60);
    contents.balances.insert(id(2), 40);
    contents.spent.insert(id(3));

    let path = file::write_file(dir.path(), 1_700_000_000, &contents).unwrap();

    assert_eq!(path, file::snapshot_path(dir.path(), 1_700_000_000));
    assert_eq!(file::timestamp_from_path(&path).unwrap(), 1_700_000_000);
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.matches(file::SNAPSHOT_SEPARATOR).count(), 1);

    let summary = file::validate_file(&path).unwrap();
    assert_eq!(summary.balances, 2);
    assert_eq!(summary.spent, 1);
    assert_eq!(summary.total_value, 100);
}

#[test]
fn test_write_includes_pending_bundles() {
    let dir = TempDir::new().unwrap();
    let mut contents = SnapshotContents::default();
    contents.pending_bundles.insert(id(5));

    let path = file::write_file(dir.path(), 42, &contents).unwrap();

    let records: Vec<SnapshotRecord> = file::open_file(&path)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(records, vec![SnapshotRecord::PendingBundle(id(5))]);
}

#[test]
fn test_timestamp_requires_numeric_stem() {
    let result = file::timestamp_from_path(std::path::Path::new("snapshot.txt"));
    assert!(matches!(result, Err(SnapshotFileError::InvalidFileName(_))));
}
