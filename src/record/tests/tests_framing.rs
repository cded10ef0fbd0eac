use std::io::Cursor;

use crate::record::{self, LogRecord, RecordError, RecordReader, WriteVersion};

fn sample_records() -> Vec<LogRecord> {
    vec![
        LogRecord::MarkerBegin { epoch: 1 },
        LogRecord::NormalEntry {
            storage: 1,
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            write_version: WriteVersion::new(1, 0),
        },
        LogRecord::RemoveEntry {
            storage: 1,
            key: b"b".to_vec(),
            write_version: WriteVersion::new(1, 1),
        },
        LogRecord::MarkerEnd { epoch: 1 },
    ]
}

fn frame_all(records: &[LogRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for rec in records {
        record::write_record(&mut buf, rec).unwrap();
    }
    buf
}

#[test]
fn test_write_then_read_stream() {
    let records = sample_records();
    let framed = frame_all(&records);

    let read: Vec<LogRecord> = RecordReader::new(Cursor::new(framed))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records, read);
}

#[test]
fn test_empty_stream_yields_nothing() {
    let mut reader = RecordReader::new(Cursor::new(Vec::new()));
    assert!(reader.next().is_none());
}

#[test]
fn test_corrupted_payload_is_checksum_mismatch() {
    let mut framed = frame_all(&sample_records());
    // Flip a byte inside the first record's payload (past the 4-byte length).
    framed[6] ^= 0xFF;

    let err = RecordReader::new(Cursor::new(framed))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert!(matches!(err, RecordError::ChecksumMismatch));
}

#[test]
fn test_truncated_tail_is_reported() {
    let framed = frame_all(&sample_records());
    // Cut the stream inside the last record.
    let cut = framed.len() - 3;

    let results: Vec<_> = RecordReader::new(Cursor::new(framed[..cut].to_vec())).collect();
    // The three complete records decode; the torn frame is an error.
    assert_eq!(results.len(), 4);
    assert!(results[..3].iter().all(Result::is_ok));
    assert!(matches!(results[3], Err(RecordError::TruncatedRecord)));
}

#[test]
fn test_oversized_length_prefix_is_rejected() {
    let mut framed = Vec::new();
    framed.extend_from_slice(&u32::MAX.to_le_bytes());
    framed.extend_from_slice(&[0u8; 16]);

    let err = record::read_record(&mut Cursor::new(framed)).unwrap_err();
    assert!(matches!(err, RecordError::RecordTooLarge(_)));
}

#[test]
fn test_reader_stops_after_error() {
    let mut framed = frame_all(&sample_records());
    framed[6] ^= 0xFF;

    let mut reader = RecordReader::new(Cursor::new(framed));
    assert!(matches!(
        reader.next(),
        Some(Err(RecordError::ChecksumMismatch))
    ));
    assert!(reader.next().is_none());
}
