// SPDX-FileCopyrightText: 2025 some100 <ootinnyoo@outlook.com>
// SPDX-License-Identifier: MIT

//! Filesystem helper functions for the durable stores.
//!
//! Every store in this crate must survive the process exiting and the machine rebooting, so nothing here returns
//! before the data is on disk. Files that are rewritten as a whole go through [`write_atomic`], which writes a
//! temporary sibling, syncs it, then renames it over the target. Readers therefore only ever see the old or the new
//! content, never a mix.
//!
//! The data directory is owned by a single process at a time through [`DirLock`].

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use log::warn;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// The name of the lock file inside of the data directory.
const LOCK_FILE: &str = "bcdmgr.lock";

/// The suffix appended to a path while it is being atomically replaced.
const TMP_SUFFIX: &str = ".tmp";

/// An error that may result from performing filesystem operations
#[derive(Error, Debug)]
pub enum FsError {
    /// An IO error from the standard library.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Another process owns the data directory.
    #[error("Data directory \"{}\" is in use by another instance", .0.display())]
    Locked(PathBuf),
}

/// An exclusive advisory lock over the data directory.
///
/// The lock is released when this is dropped, or when the process exits.
#[derive(Debug)]
pub struct DirLock {
    /// The open lock file.
    file: File,

    /// The path of the lock file.
    path: PathBuf,
}

impl DirLock {
    /// Acquires the lock on a data directory, creating the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// May return an `Error` if the directory could not be created, or another process holds the lock.
    pub fn acquire(dir: &Path) -> Result<Self, FsError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| FsError::Locked(dir.to_path_buf()))?;
        Ok(Self { file, path })
    }

    /// Returns the path of the lock file.
    #[must_use = "Has no effect if the result is unused"]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}

/// Syncs a directory so that created, renamed and deleted entries are durable.
///
/// Directories cannot be opened as files on Windows, where the rename itself is journaled by NTFS, so this does
/// nothing there.
///
/// # Errors
///
/// May return an `Error` if the directory could not be opened or synced.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Atomically replaces the content of a file.
///
/// # Errors
///
/// May return an `Error` if the temporary file could not be written, synced, or renamed over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), FsError> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Reads a file, returning [`None`] if it does not exist.
///
/// # Errors
///
/// May return an `Error` if the file exists but could not be read.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, FsError> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes a file, returning `false` if it did not exist.
///
/// # Errors
///
/// May return an `Error` if the file exists but could not be removed.
pub fn remove_if_exists(path: &Path) -> Result<bool, FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Serializes a value with `postcard`, then atomically writes it to a file.
///
/// # Errors
///
/// May return an `Error` if the value could not be encoded or the file could not be written.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let content = postcard::to_stdvec(value)?;
    write_atomic(path, &content)
}

/// Reads a file written by [`save`], returning [`None`] if it does not exist.
///
/// # Errors
///
/// May return an `Error` if the file could not be read or decoded.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FsError> {
    match read_optional(path)? {
        Some(content) => Ok(Some(postcard::from_bytes(&content)?)),
        None => Ok(None),
    }
}

/// Returns the temporary sibling used while replacing a file.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, ToOwned::to_owned);
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}
