//! File & Filesystem Abstraction
//!
//! A narrow, injectable interface over the handful of filesystem
//! operations the datastore performs. Production code uses [`StdFileOps`];
//! tests inject stub implementations to exercise fault paths (failed
//! deletes, missing files) without touching a real disk error.
//!
//! The trait is deliberately small: open/read/write/flush/sync, rename,
//! remove, copy, and directory iteration. Anything richer belongs to the
//! callers.


use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

// ------------------------------------------------------------------------------------------------
// FileOps trait
// ------------------------------------------------------------------------------------------------

/// Injectable filesystem backend.
///
/// All paths are absolute or relative to the process working directory;
/// the datastore always passes absolute paths rooted at its log
/// directory.
pub trait FileOps: Send + Sync + fmt::Debug {
    /// Creates (truncating) a file for writing.
    fn create(&self, path: &Path) -> io::Result<File>;

    /// Opens a file in append mode, creating it if absent.
    fn open_append(&self, path: &Path) -> io::Result<File>;

    /// Opens a file for reading.
    fn open_read(&self, path: &Path) -> io::Result<File>;

    /// Flushes buffered writes and syncs file contents to stable storage.
    fn flush_and_sync(&self, file: &mut File) -> io::Result<()>;

    /// Atomically renames a file.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Removes a file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Copies a file, returning the number of bytes copied.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Creates a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Returns the entries of a directory (files and directories, no
    /// recursion), in unspecified order.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// True if the path exists.
    fn exists(&self, path: &Path) -> bool;

    /// True if the path exists and is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Returns the file size in bytes.
    fn file_len(&self, path: &Path) -> io::Result<u64>;

    /// Truncates a file to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> io::Result<()>;
}

// ------------------------------------------------------------------------------------------------
// StdFileOps — the real backend
// ------------------------------------------------------------------------------------------------

/// Production [`FileOps`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn create(&self, path: &Path) -> io::Result<File> {
        File::create(path)
    }

    fn open_append(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn flush_and_sync(&self, file: &mut File) -> io::Result<()> {
        file.flush()?;
        file.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }
}
