//! File transfer into and out of sandbox containers.
//!
//! Callers describe an upload with a [`FileTransfer`]: host files (or whole
//! host directories) plus in-container path → content pairs. Both shapes are
//! normalized into one list of [`FileEntry`] values and shipped as a single
//! tar archive, so the engine extracts everything in one call.
//!
//! # Example
//!
//! ```
//! use sandbox_env::transfer::FileTransfer;
//!
//! let transfer = FileTransfer::new()
//!     .with_contents("main.py", "print('hi')")
//!     .with_contents("data/input.bin", vec![0u8, 1, 2])
//!     .with_destination("/project");
//!
//! assert_eq!(transfer.destination(), "/project/");
//! ```

pub mod archive;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::TransferError;

/// One file to place in (or read from) a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the transfer destination.
    pub path: String,
    /// Raw file contents. Text is stored as UTF-8.
    pub contents: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
}

impl FileEntry {
    /// Permission bits for entries built from in-memory content.
    pub const DEFAULT_MODE: u32 = 0o644;

    /// Creates an entry from text or bytes.
    #[must_use]
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: Self::DEFAULT_MODE,
        }
    }

    /// Sets the permission bits.
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the contents as text, if they are valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.contents).ok()
    }
}

/// A batch of files to upload into a container.
#[derive(Debug, Clone, Default)]
pub struct FileTransfer {
    host_paths: Vec<PathBuf>,
    entries: Vec<FileEntry>,
    destination: Option<String>,
}

impl FileTransfer {
    /// Creates an empty transfer targeting the container root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host file or directory, archived under the path as given
    /// (with any leading `/` removed). Directories are added recursively.
    #[must_use]
    pub fn with_host_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_paths.push(path.into());
        self
    }

    /// Adds several host files or directories.
    #[must_use]
    pub fn with_host_files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.host_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Adds an in-memory file at `path` relative to the destination.
    #[must_use]
    pub fn with_contents(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.entries.push(FileEntry::new(path, contents));
        self
    }

    /// Adds a prepared entry.
    #[must_use]
    pub fn with_entry(mut self, entry: FileEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Sets the directory the archive is extracted into (default `/`).
    ///
    /// The directory must already exist inside the container.
    #[must_use]
    pub fn with_destination(mut self, dir: impl Into<String>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    /// Returns the destination, normalized to end in exactly one `/`.
    #[must_use]
    pub fn destination(&self) -> String {
        normalize_destination(self.destination.as_deref().unwrap_or("/"))
    }

    /// Returns `true` when neither host paths nor entries were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.host_paths.is_empty() && self.entries.is_empty()
    }

    /// Reads host files and returns every entry of this transfer, host files first.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::HostIo` if a host path cannot be read.
    pub fn into_entries(self) -> Result<Vec<FileEntry>, TransferError> {
        let mut entries = Vec::with_capacity(self.host_paths.len() + self.entries.len());
        for path in &self.host_paths {
            collect_host_path(path, &mut entries)?;
        }
        entries.extend(self.entries);
        debug!(count = entries.len(), "Collected transfer entries");
        Ok(entries)
    }

    /// Reads host files and encodes the whole transfer as one tar archive.
    ///
    /// # Errors
    ///
    /// Returns `TransferError` if a host path cannot be read or an entry path
    /// is unusable.
    pub fn into_archive(self) -> Result<Vec<u8>, TransferError> {
        archive::pack(&self.into_entries()?)
    }
}

/// Normalizes a container directory so it ends in exactly one `/`.
#[must_use]
pub fn normalize_destination(dir: &str) -> String {
    format!("{}/", dir.trim_end_matches('/'))
}

fn host_io(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError + '_ {
    move |source| TransferError::HostIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Appends the entries for one host path (a file, or every file below a directory).
fn collect_host_path(path: &Path, entries: &mut Vec<FileEntry>) -> Result<(), TransferError> {
    let metadata = fs::metadata(path).map_err(host_io(path))?;

    if !metadata.is_dir() {
        entries.push(read_host_file(path, metadata.permissions().mode())?);
        return Ok(());
    }

    for item in WalkDir::new(path).sort_by_file_name() {
        let item = item.map_err(|e| {
            let failed = e.path().unwrap_or(path).to_path_buf();
            TransferError::HostIo {
                path: failed,
                source: e.into(),
            }
        })?;
        if !item.file_type().is_file() {
            trace!(path = %item.path().display(), "Skipping non-file entry");
            continue;
        }
        let mode = item
            .metadata()
            .map(|m| m.permissions().mode())
            .unwrap_or(FileEntry::DEFAULT_MODE);
        entries.push(read_host_file(item.path(), mode)?);
    }

    Ok(())
}

fn read_host_file(path: &Path, mode: u32) -> Result<FileEntry, TransferError> {
    let contents = fs::read(path).map_err(host_io(path))?;
    trace!(path = %path.display(), bytes = contents.len(), "Read host file");
    Ok(FileEntry {
        path: path.to_string_lossy().into_owned(),
        contents,
        mode: mode & 0o7777,
    })
}
