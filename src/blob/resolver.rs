//! BLOB file path resolution.
//!
//! Maps a 64-bit BLOB id to its bucketed filesystem path and back. File
//! names are 16 lowercase hex digits plus `.blob`; the bucket directory is
//! `dir_NN` where `NN = id mod DIRECTORY_COUNT`, zero-padded to two
//! digits.

use std::path::{Path, PathBuf};

use crate::record::BlobId;

/// Number of bucket directories BLOB files are distributed over.
pub const DIRECTORY_COUNT: u64 = 100;

/// Extension of every BLOB file.
const BLOB_EXTENSION: &str = ".blob";

/// Resolves file paths for BLOB ids with precomputed directory caching.
#[derive(Debug, Clone)]
pub struct BlobFileResolver {
    /// Full path to the `blob` directory.
    blob_directory: PathBuf,

    /// Precomputed bucket directory paths, indexed by `id % DIRECTORY_COUNT`.
    directory_cache: Vec<PathBuf>,
}

impl BlobFileResolver {
    /// Creates a resolver rooted at `<base_directory>/blob`.
    pub fn new(base_directory: impl AsRef<Path>) -> Self {
        let blob_directory = base_directory.as_ref().join("blob");
        let directory_cache = (0..DIRECTORY_COUNT)
            .map(|i| blob_directory.join(format!("dir_{i:02}")))
            .collect();
        Self {
            blob_directory,
            directory_cache,
        }
    }

    /// Resolves the file path for the given BLOB id.
    pub fn resolve_path(&self, blob_id: BlobId) -> PathBuf {
        let directory = &self.directory_cache[(blob_id % DIRECTORY_COUNT) as usize];
        directory.join(format!("{blob_id:016x}{BLOB_EXTENSION}"))
    }

    /// Checks whether `path` names a well-formed BLOB file: 16 hex digits
    /// followed by `.blob`.
    pub fn is_blob_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.len() != 16 + BLOB_EXTENSION.len() || !name.ends_with(BLOB_EXTENSION) {
            return false;
        }
        name[..16].bytes().all(|c| c.is_ascii_hexdigit())
    }

    /// Extracts the BLOB id from a well-formed BLOB file path.
    ///
    /// Returns `None` if the name does not conform to the expected format.
    pub fn extract_blob_id(&self, path: &Path) -> Option<BlobId> {
        if !self.is_blob_file(path) {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        BlobId::from_str_radix(&name[..16], 16).ok()
    }

    /// Root directory the garbage collector scans.
    pub fn blob_root(&self) -> &Path {
        &self.blob_directory
    }
}
