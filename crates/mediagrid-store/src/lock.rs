//! Per-directory advisory locking.
//!
//! A directory is locked by taking an OS advisory lock on a hidden `.lock`
//! file within it.  Once created, lock files are left in place; they stay
//! zero-sized and take no extents.  Lock files are excluded from csync2
//! replication.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::{debug, trace};

/// The filename used for lock files within a directory.
pub(crate) const LOCK_FILE: &str = ".lock";

/// Scoped shared-or-exclusive lock on a directory.
///
/// The OS lock is held for the lifetime of the value and released on drop.
/// Acquisition blocks; callers needing a timeout enforce one externally.
/// The lock is honoured across processes on the same host (flock).
#[derive(Debug)]
pub struct DirectoryLock {
    file: fs::File,
    shared: bool,
}

impl DirectoryLock {
    /// Locks a directory, atomically creating the lock file when first
    /// needed.
    pub fn acquire(dir: &Path, shared: bool) -> io::Result<Self> {
        let lock_file = dir.join(LOCK_FILE);
        match fs::symlink_metadata(&lock_file) {
            Ok(meta) => {
                trace!(path = %lock_file.display(), "found existing lock file");
                if !meta.is_file() {
                    return Err(io::Error::other(format!(
                        "lock file is not a regular file: {}",
                        lock_file.display()
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %lock_file.display(), "creating new lock file");
            }
            Err(e) => return Err(e),
        }
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(crate::fs_util::NEW_FILE_MODE);
        }
        let file = options.open(&lock_file)?;
        if shared {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        Ok(DirectoryLock { file, shared })
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_file_created_empty_and_left_behind() {
        let temp = TempDir::new().unwrap();
        {
            let lock = DirectoryLock::acquire(temp.path(), false).unwrap();
            assert!(!lock.is_shared());
        }
        let lock_file = temp.path().join(LOCK_FILE);
        let meta = fs::metadata(&lock_file).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn reacquire_after_release() {
        let temp = TempDir::new().unwrap();
        drop(DirectoryLock::acquire(temp.path(), false).unwrap());
        drop(DirectoryLock::acquire(temp.path(), true).unwrap());
        drop(DirectoryLock::acquire(temp.path(), false).unwrap());
    }

    #[test]
    fn rejects_non_regular_lock_file() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(LOCK_FILE)).unwrap();
        assert!(DirectoryLock::acquire(temp.path(), true).is_err());
    }
}
