//! WAL Record Format
//!
//! This module defines the **on-disk log entry format**: a tagged union of
//! data entries, tombstones, storage-lifecycle events, and epoch markers,
//! together with the CRC-protected framing used by every WAL, epoch, and
//! snapshot file in the datastore.
//!
//! ## Design Overview
//!
//! A [`LogRecord`] is the unit of WAL content. Data-carrying variants hold
//! a storage id, key/value bytes, and a [`WriteVersion`]; marker variants
//! carry only an epoch id. Records are serialized with [`crate::encoding`]
//! and framed on disk so that readers can stream a file record-by-record
//! and detect truncation or corruption.
//!
//! # On-disk layout
//!
//! ```text
//! [REC_LEN_LE][TYPE_TAG][REC_FIELDS][REC_CRC32_LE]
//! [REC_LEN_LE][TYPE_TAG][REC_FIELDS][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Length** — 4-byte little-endian length of `TYPE_TAG + REC_FIELDS`.
//! - **Fields** — serialized via the [`crate::encoding`] wire format.
//! - **CRC** — CRC32 computed over `len || tag || fields`.
//!
//! The engine is the sole writer of these files; readers accept exactly
//! what writers emit.
//!
//! # Ordering
//!
//! Records that address a key sort by [`key_sid`] — the big-endian storage
//! id concatenated with the raw key bytes. Sorting the composite byte
//! string groups a storage's keys together and orders keys bytewise within
//! it; the snapshot file and the compacted file are both maintained in
//! this order.
//!
//! # Guarantees
//!
//! - **Determinism:** the same record always encodes to the same bytes.
//! - **Integrity:** every record carries a CRC32 over its framed bytes.
//! - **Self-delimiting:** a reader never needs out-of-band size metadata.

#[cfg(test)]
mod tests;

use std::io::{self, Read, Write};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crc32fast::Hasher as Crc32;
use thiserror::Error;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Identifier types
// ------------------------------------------------------------------------------------------------

/// Monotonically increasing durability boundary. Never decreases across
/// restarts.
pub type EpochId = u64;

/// Opaque 64-bit namespace tag for user storages.
pub type StorageId = u64;

/// Unique-for-database-lifetime identifier of an out-of-line BLOB.
pub type BlobId = u64;

// ------------------------------------------------------------------------------------------------
// Write version
// ------------------------------------------------------------------------------------------------

/// Strictly ordered pair ⟨epoch major, minor⟩ used to reconcile competing
/// writes to the same key.
///
/// Ordering is lexicographic: the derived `Ord` compares `major` first,
/// then `minor` — exactly the reconciliation order the merge layers rely
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WriteVersion {
    /// Epoch major component. Every entry written inside epoch `e` carries
    /// `major == e`.
    pub major: u64,

    /// Per-session increasing sequence within the major epoch.
    pub minor: u64,
}

impl WriteVersion {
    /// Creates a write version from its components.
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl Encode for WriteVersion {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.major.encode_to(buf)?;
        self.minor.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for WriteVersion {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (major, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (minor, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { major, minor }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Composite sort key
// ------------------------------------------------------------------------------------------------

/// Builds the composite sort key for `(storage, key)`: the big-endian
/// storage id followed by the raw key bytes.
///
/// Byte-wise comparison of the result orders first by storage id, then by
/// key, which is the order the snapshot and compacted files maintain.
pub fn key_sid(storage: StorageId, key: &[u8]) -> Vec<u8> {
    let mut sid = Vec::with_capacity(8 + key.len());
    sid.extend_from_slice(&storage.to_be_bytes());
    sid.extend_from_slice(key);
    sid
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by record framing operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// A record was cut off mid-frame — a torn trailing write.
    #[error("Truncated record at end of file")]
    TruncatedRecord,
}

// ------------------------------------------------------------------------------------------------
// LogRecord — the tagged union
// ------------------------------------------------------------------------------------------------

/// Maximum framed record size (1 GiB). A length prefix above this value
/// is treated as corruption rather than attempted as an allocation.
pub const MAX_RECORD_SIZE: u32 = 1024 * 1024 * 1024;

mod tag {
    pub const NORMAL_ENTRY: u8 = 0x01;
    pub const REMOVE_ENTRY: u8 = 0x02;
    pub const CLEAR_STORAGE: u8 = 0x03;
    pub const ADD_STORAGE: u8 = 0x04;
    pub const REMOVE_STORAGE: u8 = 0x05;
    pub const NORMAL_WITH_BLOB: u8 = 0x06;
    pub const MARKER_BEGIN: u8 = 0x41;
    pub const MARKER_END: u8 = 0x42;
    pub const MARKER_DURABLE: u8 = 0x43;
    pub const MARKER_INVALIDATED_BEGIN: u8 = 0x44;
}

/// The unit of WAL content: data entries, tombstones, storage-lifecycle
/// events, and epoch markers.
///
/// Every data entry lies strictly between a `MarkerBegin(e)` and a
/// `MarkerEnd(e)` of its channel file and carries `major == e` in its
/// write version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A key/value write.
    NormalEntry {
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
    },

    /// A key/value write that references out-of-line BLOBs.
    NormalWithBlob {
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
        blob_ids: Vec<BlobId>,
    },

    /// Tombstone: erases the key at all prior and equal-or-older versions.
    RemoveEntry {
        storage: StorageId,
        key: Vec<u8>,
        write_version: WriteVersion,
    },

    /// Erases every entry of the storage at or below the write version.
    ClearStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },

    /// Registers a storage id.
    AddStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },

    /// Removes a storage and every entry at or below the write version.
    RemoveStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },

    /// Opens a session region for the epoch.
    MarkerBegin { epoch: EpochId },

    /// Closes a session region for the epoch.
    MarkerEnd { epoch: EpochId },

    /// In an epoch file: all entries with major ≤ epoch are durable.
    MarkerDurable { epoch: EpochId },

    /// Supersedes a prior `MarkerBegin(epoch)` in the same file and marks
    /// the enclosed region unrecoverable.
    MarkerInvalidatedBegin { epoch: EpochId },
}

impl LogRecord {
    /// Returns the storage id for data-carrying variants.
    pub fn storage(&self) -> Option<StorageId> {
        match self {
            LogRecord::NormalEntry { storage, .. }
            | LogRecord::NormalWithBlob { storage, .. }
            | LogRecord::RemoveEntry { storage, .. }
            | LogRecord::ClearStorage { storage, .. }
            | LogRecord::AddStorage { storage, .. }
            | LogRecord::RemoveStorage { storage, .. } => Some(*storage),
            _ => None,
        }
    }

    /// Returns the write version for data-carrying variants.
    pub fn write_version(&self) -> Option<WriteVersion> {
        match self {
            LogRecord::NormalEntry { write_version, .. }
            | LogRecord::NormalWithBlob { write_version, .. }
            | LogRecord::RemoveEntry { write_version, .. }
            | LogRecord::ClearStorage { write_version, .. }
            | LogRecord::AddStorage { write_version, .. }
            | LogRecord::RemoveStorage { write_version, .. } => Some(*write_version),
            _ => None,
        }
    }

    /// Returns the epoch id for marker variants.
    pub fn marker_epoch(&self) -> Option<EpochId> {
        match self {
            LogRecord::MarkerBegin { epoch }
            | LogRecord::MarkerEnd { epoch }
            | LogRecord::MarkerDurable { epoch }
            | LogRecord::MarkerInvalidatedBegin { epoch } => Some(*epoch),
            _ => None,
        }
    }

    /// Returns the raw key bytes for keyed variants.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            LogRecord::NormalEntry { key, .. }
            | LogRecord::NormalWithBlob { key, .. }
            | LogRecord::RemoveEntry { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Returns the composite sort key for keyed variants.
    pub fn key_sid(&self) -> Option<Vec<u8>> {
        match self {
            LogRecord::NormalEntry { storage, key, .. }
            | LogRecord::NormalWithBlob { storage, key, .. }
            | LogRecord::RemoveEntry { storage, key, .. } => Some(key_sid(*storage, key)),
            _ => None,
        }
    }

    /// Returns the referenced BLOB ids, empty for non-BLOB variants.
    pub fn blob_ids(&self) -> &[BlobId] {
        match self {
            LogRecord::NormalWithBlob { blob_ids, .. } => blob_ids,
            _ => &[],
        }
    }

    /// True for `RemoveEntry`.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, LogRecord::RemoveEntry { .. })
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            LogRecord::NormalEntry {
                storage,
                key,
                value,
                write_version,
            } => {
                tag::NORMAL_ENTRY.encode_to(buf)?;
                storage.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
                write_version.encode_to(buf)?;
            }
            LogRecord::NormalWithBlob {
                storage,
                key,
                value,
                write_version,
                blob_ids,
            } => {
                tag::NORMAL_WITH_BLOB.encode_to(buf)?;
                storage.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
                write_version.encode_to(buf)?;
                encoding::encode_vec(blob_ids, buf)?;
            }
            LogRecord::RemoveEntry {
                storage,
                key,
                write_version,
            } => {
                tag::REMOVE_ENTRY.encode_to(buf)?;
                storage.encode_to(buf)?;
                key.encode_to(buf)?;
                write_version.encode_to(buf)?;
            }
            LogRecord::ClearStorage {
                storage,
                write_version,
            } => {
                tag::CLEAR_STORAGE.encode_to(buf)?;
                storage.encode_to(buf)?;
                write_version.encode_to(buf)?;
            }
            LogRecord::AddStorage {
                storage,
                write_version,
            } => {
                tag::ADD_STORAGE.encode_to(buf)?;
                storage.encode_to(buf)?;
                write_version.encode_to(buf)?;
            }
            LogRecord::RemoveStorage {
                storage,
                write_version,
            } => {
                tag::REMOVE_STORAGE.encode_to(buf)?;
                storage.encode_to(buf)?;
                write_version.encode_to(buf)?;
            }
            LogRecord::MarkerBegin { epoch } => {
                tag::MARKER_BEGIN.encode_to(buf)?;
                epoch.encode_to(buf)?;
            }
            LogRecord::MarkerEnd { epoch } => {
                tag::MARKER_END.encode_to(buf)?;
                epoch.encode_to(buf)?;
            }
            LogRecord::MarkerDurable { epoch } => {
                tag::MARKER_DURABLE.encode_to(buf)?;
                epoch.encode_to(buf)?;
            }
            LogRecord::MarkerInvalidatedBegin { epoch } => {
                tag::MARKER_INVALIDATED_BEGIN.encode_to(buf)?;
                epoch.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (type_tag, mut offset) = u8::decode_from(buf)?;
        let record = match type_tag {
            tag::NORMAL_ENTRY => {
                let (storage, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (write_version, n) = WriteVersion::decode_from(&buf[offset..])?;
                offset += n;
                LogRecord::NormalEntry {
                    storage,
                    key,
                    value,
                    write_version,
                }
            }
            tag::NORMAL_WITH_BLOB => {
                let (storage, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (write_version, n) = WriteVersion::decode_from(&buf[offset..])?;
                offset += n;
                let (blob_ids, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                LogRecord::NormalWithBlob {
                    storage,
                    key,
                    value,
                    write_version,
                    blob_ids,
                }
            }
            tag::REMOVE_ENTRY => {
                let (storage, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (write_version, n) = WriteVersion::decode_from(&buf[offset..])?;
                offset += n;
                LogRecord::RemoveEntry {
                    storage,
                    key,
                    write_version,
                }
            }
            tag::CLEAR_STORAGE | tag::ADD_STORAGE | tag::REMOVE_STORAGE => {
                let (storage, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (write_version, n) = WriteVersion::decode_from(&buf[offset..])?;
                offset += n;
                match type_tag {
                    tag::CLEAR_STORAGE => LogRecord::ClearStorage {
                        storage,
                        write_version,
                    },
                    tag::ADD_STORAGE => LogRecord::AddStorage {
                        storage,
                        write_version,
                    },
                    _ => LogRecord::RemoveStorage {
                        storage,
                        write_version,
                    },
                }
            }
            tag::MARKER_BEGIN | tag::MARKER_END | tag::MARKER_DURABLE
            | tag::MARKER_INVALIDATED_BEGIN => {
                let (epoch, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                match type_tag {
                    tag::MARKER_BEGIN => LogRecord::MarkerBegin { epoch },
                    tag::MARKER_END => LogRecord::MarkerEnd { epoch },
                    tag::MARKER_DURABLE => LogRecord::MarkerDurable { epoch },
                    _ => LogRecord::MarkerInvalidatedBegin { epoch },
                }
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "LogRecord",
                });
            }
        };
        Ok((record, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Framed record I/O
// ------------------------------------------------------------------------------------------------

/// Serializes one record and writes it with the standard framing:
/// `[u32 len LE][record bytes][u32 crc32 LE]`, where the CRC is computed
/// over `len || record bytes`.
pub fn write_record<W: Write>(writer: &mut W, record: &LogRecord) -> Result<(), RecordError> {
    let record_bytes = encoding::encode_to_vec(record)?;
    let record_len = u32::try_from(record_bytes.len())
        .map_err(|_| RecordError::RecordTooLarge(record_bytes.len()))?;
    if record_len > MAX_RECORD_SIZE {
        return Err(RecordError::RecordTooLarge(record_len as usize));
    }

    let len_bytes = record_len.to_le_bytes();
    let checksum = compute_crc(&[&len_bytes, &record_bytes]);

    writer.write_all(&len_bytes)?;
    writer.write_all(&record_bytes)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// Reads one framed record from the stream.
///
/// Returns `Ok(None)` at a clean end of file (the length prefix is
/// absent). A record cut off mid-frame yields
/// [`RecordError::TruncatedRecord`] so callers can distinguish a torn
/// trailing write from corruption in the middle of a file.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogRecord>, RecordError> {
    Ok(read_record_framed(reader)?.map(|(record, _)| record))
}

/// Like [`read_record`], additionally reporting the on-disk frame size
/// (length prefix + payload + checksum) so callers can track byte
/// positions within a file.
pub fn read_record_framed<R: Read>(
    reader: &mut R,
) -> Result<Option<(LogRecord, u64)>, RecordError> {
    let mut len_bytes = [0u8; U32_SIZE];
    match read_exact_or_eof(reader, &mut len_bytes)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => return Err(RecordError::TruncatedRecord),
        ReadOutcome::Full => {}
    }

    let record_len = u32::from_le_bytes(len_bytes);
    if record_len > MAX_RECORD_SIZE {
        return Err(RecordError::RecordTooLarge(record_len as usize));
    }

    let mut record_bytes = vec![0u8; record_len as usize];
    match read_exact_or_eof(reader, &mut record_bytes)? {
        ReadOutcome::Full => {}
        _ => return Err(RecordError::TruncatedRecord),
    }

    let mut checksum_bytes = [0u8; U32_SIZE];
    match read_exact_or_eof(reader, &mut checksum_bytes)? {
        ReadOutcome::Full => {}
        _ => return Err(RecordError::TruncatedRecord),
    }
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let computed = compute_crc(&[&len_bytes, &record_bytes]);
    if computed != stored_checksum {
        return Err(RecordError::ChecksumMismatch);
    }

    let (record, _) = encoding::decode_from_slice::<LogRecord>(&record_bytes)?;
    let frame_size = (U32_SIZE + record_bytes.len() + U32_SIZE) as u64;
    Ok(Some((record, frame_size)))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

/// Fills `buf` completely, or reports a clean EOF (zero bytes read) or a
/// partial fill (stream ended inside the buffer).
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, RecordError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecordError::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}

// ------------------------------------------------------------------------------------------------
// RecordReader — streaming iterator over a framed file
// ------------------------------------------------------------------------------------------------

/// Streaming reader yielding every framed record of an input stream.
///
/// The iterator stops at a clean EOF; framing errors (checksum mismatch,
/// truncation) surface as `Err` items and end iteration.
/// [`position`](Self::position) reports the byte offset just past the
/// most recently returned record.
pub struct RecordReader<R: Read> {
    reader: R,
    position: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// Wraps a readable stream positioned at the first record.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
            done: false,
        }
    }

    /// Byte offset just past the last successfully read record.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<LogRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record_framed(&mut self.reader) {
            Ok(Some((record, frame_size))) => {
                self.position += frame_size;
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

/// Computes a CRC32 checksum over one or more byte slices.
pub(crate) fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
