//! Tar encoding for container file transfer.
//!
//! Archives are plain uncompressed tar streams, the format Docker's archive
//! endpoints accept and return. Only file entries are written: the engine
//! creates missing parent directories and leaves existing ones untouched.

use std::io::Read;

use chrono::Utc;
use tar::{Archive, Builder, EntryType, Header};
use tracing::trace;

use super::FileEntry;
use crate::error::TransferError;

/// Wraps a tar I/O failure with context.
fn archive_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> TransferError {
    let context = context.into();
    move |source| TransferError::Archive { context, source }
}

/// Normalizes an entry path for storage in an archive.
///
/// Leading `/` and `.` components are dropped, so `/tmp/a.py` and `./tmp/a.py`
/// both become `tmp/a.py`. Paths escaping the destination (`..`) are rejected.
///
/// # Errors
///
/// Returns `TransferError::InvalidPath` for empty paths or `..` components.
pub fn entry_name(path: &str) -> Result<String, TransferError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(TransferError::InvalidPath {
                    path: path.to_string(),
                    reason: "parent directory components are not allowed".to_string(),
                });
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(TransferError::InvalidPath {
            path: path.to_string(),
            reason: "path has no file name".to_string(),
        });
    }

    Ok(parts.join("/"))
}

/// Builds an uncompressed tar archive in memory.
///
/// An empty slice yields a valid, empty archive.
///
/// # Errors
///
/// Returns `TransferError::InvalidPath` for unusable entry paths and
/// `TransferError::Archive` if tar encoding fails.
pub fn pack(entries: &[FileEntry]) -> Result<Vec<u8>, TransferError> {
    let mtime = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    let mut builder = Builder::new(Vec::new());

    for entry in entries {
        let name = entry_name(&entry.path)?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.contents.len() as u64);
        header.set_mode(entry.mode);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, &name, entry.contents.as_slice())
            .map_err(archive_err(format!("failed to add {name}")))?;
        trace!(%name, bytes = entry.contents.len(), "Added archive entry");
    }

    builder
        .into_inner()
        .map_err(archive_err("failed to finish archive"))
}

/// Reads every regular file out of a tar archive.
///
/// Directories, links and other special entries are skipped.
///
/// # Errors
///
/// Returns `TransferError::Archive` if the stream is not a readable tar archive.
pub fn unpack(bytes: &[u8]) -> Result<Vec<FileEntry>, TransferError> {
    let mut archive = Archive::new(bytes);
    let mut files = Vec::new();

    for entry in archive
        .entries()
        .map_err(archive_err("failed to read archive"))?
    {
        let mut entry = entry.map_err(archive_err("failed to read archive entry"))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let path = entry
            .path()
            .map_err(archive_err("archive entry has an invalid path"))?
            .to_string_lossy()
            .into_owned();
        let mode = entry.header().mode().unwrap_or(FileEntry::DEFAULT_MODE);

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(archive_err("failed to read archive entry contents"))?;

        files.push(FileEntry {
            path,
            contents,
            mode,
        });
    }

    Ok(files)
}

/// Selects the entry an engine returns for a single-file download of `requested`.
///
/// Engines name that entry after the file's base name, so `/project/out.txt`
/// is looked up as `out.txt`.
///
/// # Errors
///
/// Returns `TransferError::MissingEntry` when no regular file of that name is present.
pub fn extract_file(bytes: &[u8], requested: &str) -> Result<FileEntry, TransferError> {
    let wanted = requested
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    unpack(bytes)?
        .into_iter()
        .find(|entry| entry.path.trim_start_matches("./") == wanted)
        .ok_or(TransferError::MissingEntry { name: wanted })
}
