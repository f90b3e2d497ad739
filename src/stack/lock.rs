//! Exclusive-creation lock files.
//!
//! A lock file is acquired by creating `<path>` with `O_CREAT | O_EXCL`
//! semantics: existence of the file *is* the lock. The list-file lock
//! (`<list>.lock`) additionally doubles as the staging area for the next
//! list contents — the holder writes the new name list into the held fd
//! and commits it by renaming the lock onto the list file, which is the
//! atomic linearisation point of every stack mutation.
//!
//! Per-table locks taken during compaction use the same type but are
//! never written or committed; dropping the guard unlinks them.
//!
//! The guard releases on every exit path: unless [`LockFile::commit`]
//! consumed it, `Drop` closes the descriptor and unlinks the lock path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Errors from lock acquisition and commit.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file already exists — another mutator holds the stack (or
    /// crashed and left a stale lock behind; stale locks require manual
    /// cleanup).
    #[error("lock file {0} is held")]
    Held(PathBuf),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An exclusively created lock file, unlinked on drop unless committed.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl LockFile {
    /// Acquires the lock by exclusive creation of `path`.
    pub fn acquire(path: PathBuf) -> Result<Self, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => Ok(Self {
                path,
                file: Some(file),
                committed: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Held(path)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Writes `bytes` into the held lock file.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("lock file already committed"));
        };
        file.write_all(bytes)
    }

    /// Promotes the lock onto `dest` by `rename`, committing its contents
    /// atomically. The descriptor is closed first so no unlink ever runs
    /// against a path the rename already consumed.
    pub fn commit(mut self, dest: &Path) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        fs::rename(&self.path, dest)?;
        self.committed = true;
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Close before unlink.
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %e, "failed to remove lock file");
        }
    }
}
