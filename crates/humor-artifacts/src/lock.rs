//! Cross-process writer lock for an artifact store.
//!
//! Every process that mutates `<root>/versions` or `slots.json` holds an
//! exclusive advisory lock on `<root>/.lock` while doing so. The lock file
//! itself is never removed; only the OS lock on it matters.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

pub(crate) const LOCK_FILE: &str = ".lock";

/// A held writer lock, released on drop.
#[derive(Debug)]
pub(crate) struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    fn open_file(root: &Path) -> io::Result<(File, PathBuf)> {
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    /// Block until the lock is ours.
    pub(crate) fn acquire(root: &Path) -> io::Result<Self> {
        let (file, path) = Self::open_file(root)?;
        file.lock_exclusive()?;
        debug!(lock = %path.display(), "store lock acquired");
        Ok(Self { file, path })
    }

    /// Take the lock only if no other writer holds it.
    pub(crate) fn try_acquire(root: &Path) -> io::Result<Option<Self>> {
        let (file, path) = Self::open_file(root)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(lock = %self.path.display(), error = %e, "store lock release failed");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
