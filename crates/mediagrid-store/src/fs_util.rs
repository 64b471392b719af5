//! Filesystem helpers shared across the engine.
//!
//! New directories are created 0o770 and new files 0o640 (no world
//! access); the permission bits are applied only on Unix filesystems.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::replicate::Replicator;
use crate::{CdnError, Result};

/// Mode for new directories: owner+group rwx.
#[cfg(unix)]
pub(crate) const NEW_DIRECTORY_MODE: u32 = 0o770;

/// Mode for new files: owner rw, group r.
#[cfg(unix)]
pub(crate) const NEW_FILE_MODE: u32 = 0o640;

/// Creates a single directory with the expected permissions.
pub(crate) fn make_directory(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(NEW_DIRECTORY_MODE);
    }
    builder.create(dir)
}

/// Creates a directory if missing, optionally with any missing parents, and
/// verifies that anything already present is a directory.
///
/// When `replicator` is given, a newly created directory is immediately
/// replicated to the cluster.
pub(crate) fn make_directory_if_needed(
    replicator: Option<&dyn Replicator>,
    dir: &Path,
    mkdirs: bool,
) -> Result<PathBuf> {
    match fs::symlink_metadata(dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(CdnError::InvalidState(format!(
                    "existing is not a directory: {}",
                    dir.display()
                )));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if mkdirs {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(NEW_DIRECTORY_MODE);
                }
                builder.create(dir)?;
            } else {
                make_directory(dir)?;
            }
            if let Some(replicator) = replicator {
                replicator.replicate(&[dir.to_path_buf()]);
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(dir.to_path_buf())
}

/// Lists a directory into a `Vec`, without following symlinks.
pub(crate) fn list(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        paths.push(entry?.path());
    }
    Ok(paths)
}

/// Gets the final path component as UTF-8, or empty string when none.
///
/// Entries whose names are not UTF-8 cannot be valid hash or version names
/// and fall through the callers' skip/report paths.
pub(crate) fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Moves a file into place, preferring an atomic rename and falling back to
/// copy-then-delete when the rename crosses a filesystem boundary.
pub(crate) fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                "atomic rename not supported, reverting to copy/delete"
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
