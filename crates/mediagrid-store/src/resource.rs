//! One committed asset and its versions.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::content_type::ContentType;
use crate::fsck::{FsckContext, FsckIssue, Severity};
use crate::lock::{DirectoryLock, LOCK_FILE};
use crate::naming::ResourceId;
use crate::replicate::Replicator;
use crate::version::Version;
use crate::{fs_util, CdnError, Result, EXTENSION_SEPARATOR, NEW_EXTENSION};

/// The filename prefix used for the original-version symlink.
pub(crate) const ORIGINAL_PREFIX: &str = "original";

fn original_sep() -> String {
    format!("{ORIGINAL_PREFIX}{EXTENSION_SEPARATOR}")
}

/// A resource has the originally deposited content plus any number of
/// derived versions (scaled sizes today; reduced quality, changed frame
/// rates and such for future types).
///
/// Backed by one directory in the resources hash tree.  The directory may
/// not yet exist while a new resource is being staged in its `*.new`
/// directory.
#[derive(Clone)]
pub struct Resource {
    id: ResourceId,
    dir: PathBuf,
    replicator: Arc<dyn Replicator>,
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.dir == other.dir
    }
}

impl Eq for Resource {}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .finish()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.dir.display())
    }
}

impl Resource {
    pub(crate) fn new(id: ResourceId, dir: PathBuf, replicator: Arc<dyn Replicator>) -> Self {
        Resource {
            id,
            dir,
            replicator,
        }
    }

    /// The unique identifier of this resource.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The resource directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn replicator(&self) -> &dyn Replicator {
        self.replicator.as_ref()
    }

    /// Locks the resource directory.
    pub(crate) fn lock(&self, shared: bool) -> io::Result<DirectoryLock> {
        DirectoryLock::acquire(&self.dir, shared)
    }

    /// Is this directory entry a version file?  Skips the lock file, the
    /// original symlink, staging files, and (when given) extensions other
    /// than `content_type`'s.
    fn is_version_entry(file_name: &str, content_type: Option<ContentType>) -> bool {
        let dot_new = format!("{EXTENSION_SEPARATOR}{NEW_EXTENSION}");
        file_name != LOCK_FILE
            && !file_name.starts_with(&original_sep())
            && !file_name.ends_with(&dot_new)
            && content_type.is_none_or(|ct| {
                file_name.ends_with(&format!("{EXTENSION_SEPARATOR}{}", ct.extension()))
            })
    }

    /// Gets all versions of this resource, optionally filtered by content
    /// type.
    ///
    /// No locking is performed: versions are immutable once visible.
    pub fn versions(&self, content_type: Option<ContentType>) -> Result<Vec<Version>> {
        let mut versions = Vec::new();
        for path in fs_util::list(&self.dir)? {
            let file_name = fs_util::file_name(&path);
            if !Self::is_version_entry(file_name, content_type) {
                continue;
            }
            let ct = match content_type {
                Some(ct) => ct,
                None => {
                    let extension = file_name
                        .rsplit_once(EXTENSION_SEPARATOR)
                        .map(|(_, ext)| ext)
                        .ok_or_else(|| {
                            CdnError::NotFound(format!(
                                "unable to find extension to determine content type: {}",
                                path.display()
                            ))
                        })?;
                    ContentType::for_extension(extension)?
                }
            };
            versions.push(ct.version_by_parse_filename(self, &path)?);
        }
        Ok(versions)
    }

    /// Finds a version matching the candidate bytes and the given type, by
    /// size then full byte-by-byte comparison.
    ///
    /// No locking is performed: versions are immutable once visible.
    pub(crate) fn find_version(
        &self,
        candidate: &Path,
        candidate_size: u64,
        content_type: ContentType,
    ) -> Result<Option<Version>> {
        for version in self.versions(Some(content_type))? {
            if version.size()? == candidate_size && files_equal(candidate, version.file())? {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    /// Determines the original content type by scanning for the
    /// `original.<extension>` entry.  Only filenames are examined; the
    /// symlink itself is not followed.
    pub fn original_content_type(&self) -> Result<ContentType> {
        let sep = original_sep();
        for path in fs_util::list(&self.dir)? {
            let file_name = fs_util::file_name(&path);
            if let Some(extension) = file_name.strip_prefix(&sep) {
                for ct in ContentType::ALL {
                    if ct.extension() == extension {
                        return Ok(ct);
                    }
                }
            }
        }
        Err(CdnError::InvalidState(format!(
            "unable to match {sep}* to any content type extension: {}",
            self.dir.display()
        )))
    }

    /// Gets the original version by following the `original.*` symlink and
    /// parsing the target filename.
    pub fn original(&self) -> Result<Version> {
        let original_type = self.original_content_type()?;
        let symlink = self.dir.join(format!(
            "{ORIGINAL_PREFIX}{EXTENSION_SEPARATOR}{}",
            original_type.extension()
        ));
        let target = fs::canonicalize(&symlink).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CdnError::NotFound(format!("original symlink missing: {}", symlink.display()))
            } else {
                e.into()
            }
        })?;
        original_type.version_by_parse_filename(self, &target)
    }

    /// Integrity check of one resource directory, verifying the original
    /// symlink and every version filename.  Locks the resource shared at
    /// runtime and exclusive at start-up; start-up passes also remove
    /// stray `*.new` version files.
    pub(crate) fn fsck_resource(&self, ctx: &mut FsckContext) {
        let _lock = match self.lock(ctx.lock_shared()) {
            Ok(lock) => lock,
            Err(e) => {
                ctx.put(
                    self.dir.clone(),
                    FsckIssue::with_cause(Severity::Severe, e, "Unable to lock resource directory"),
                );
                return;
            }
        };
        let paths = match fs_util::list(&self.dir) {
            Ok(paths) => paths,
            Err(e) => {
                ctx.put(
                    self.dir.clone(),
                    FsckIssue::with_cause(Severity::Severe, e, "Unable to list resource directory"),
                );
                return;
            }
        };
        self.fsck_original(ctx, &paths);
        self.fsck_versions(ctx, &paths);
    }

    /// Verifies there is exactly one `original.*` entry, that it is a
    /// symlink to an existing sibling, and that the target extension
    /// matches.
    fn fsck_original(&self, ctx: &mut FsckContext, paths: &[PathBuf]) {
        let sep = original_sep();
        let mut original_path = None;
        let mut duplicated = false;
        for path in paths {
            if fs_util::file_name(path).starts_with(&sep) {
                if let Some(first) = original_path.take() {
                    ctx.put(
                        self.dir.clone(),
                        FsckIssue::new(
                            Severity::Severe,
                            format!(
                                "More than one {sep}* path found in resource directory:\n  \
                                 path 1: {:?}\n  path 2: {:?}",
                                first, path
                            ),
                        ),
                    );
                    duplicated = true;
                    break;
                }
                original_path = Some(path.clone());
            }
        }
        let Some(original_path) = original_path else {
            if !duplicated {
                ctx.put(
                    self.dir.clone(),
                    FsckIssue::new(
                        Severity::Severe,
                        format!("No {sep}* path found in resource directory"),
                    ),
                );
            }
            return;
        };
        let is_symlink = fs::symlink_metadata(&original_path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            ctx.put(
                original_path,
                FsckIssue::new(Severity::Severe, "Original is not a symlink"),
            );
            return;
        }
        let file_name = fs_util::file_name(&original_path).to_owned();
        let extension = file_name.strip_prefix(&sep).unwrap_or("");
        let Ok(original_type) = ContentType::for_extension(extension) else {
            ctx.put(
                original_path,
                FsckIssue::new(Severity::Warning, "Original is not a supported content type"),
            );
            return;
        };
        let target = match fs::canonicalize(&original_path) {
            Ok(target) => target,
            Err(_) => {
                ctx.put(
                    original_path,
                    FsckIssue::new(Severity::Severe, "Original version does not exist"),
                );
                return;
            }
        };
        let expected = format!("{EXTENSION_SEPARATOR}{}", original_type.extension());
        if !fs_util::file_name(&target).ends_with(&expected) {
            ctx.put(
                target,
                FsckIssue::new(
                    Severity::Severe,
                    format!(
                        "Original version has mismatched extension: expected {}",
                        original_type.extension()
                    ),
                ),
            );
        }
    }

    /// Verifies every non-lock, non-original entry parses as a version,
    /// removing stray `*.new` files at start-up.
    fn fsck_versions(&self, ctx: &mut FsckContext, paths: &[PathBuf]) {
        let sep = original_sep();
        let dot_new = format!("{EXTENSION_SEPARATOR}{NEW_EXTENSION}");
        for path in paths {
            let file_name = fs_util::file_name(path);
            // Lock file is verified during locking, originals above
            if file_name == LOCK_FILE || file_name.starts_with(&sep) {
                continue;
            }
            if file_name.ends_with(&dot_new) {
                let is_file = fs::symlink_metadata(path)
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                if !is_file {
                    ctx.put(
                        path.clone(),
                        FsckIssue::new(Severity::Severe, "New version is not a regular file"),
                    );
                } else if !ctx.lock_shared() {
                    match fs::remove_file(path) {
                        Ok(()) => ctx.put(
                            path.clone(),
                            FsckIssue::new(Severity::Info, "Deleted new version file"),
                        ),
                        Err(e) => ctx.put(
                            path.clone(),
                            FsckIssue::with_cause(
                                Severity::Severe,
                                e,
                                "Unable to delete new version file",
                            ),
                        ),
                    }
                } else {
                    // TODO: Upgrade to warning for *.new older than a certain time frame
                    ctx.put(
                        path.clone(),
                        FsckIssue::new(Severity::Info, "Skipping new version file"),
                    );
                }
                continue;
            }
            // All other files should be versions
            let Some((_, extension)) = file_name.rsplit_once(EXTENSION_SEPARATOR) else {
                ctx.put(
                    path.clone(),
                    FsckIssue::new(
                        Severity::Warning,
                        "Unable to find extension to determine content type",
                    ),
                );
                continue;
            };
            match ContentType::for_extension(extension) {
                Err(e) => ctx.put(
                    path.clone(),
                    FsckIssue::with_cause(Severity::Warning, e, "Unsupported content type"),
                ),
                Ok(ct) => match ct.version_by_parse_filename(self, path) {
                    Err(e) => ctx.put(
                        path.clone(),
                        FsckIssue::with_cause(
                            Severity::Warning,
                            e,
                            "Unable to parse version filename",
                        ),
                    ),
                    Ok(version) => version.fsck_version(&mut ctx.report),
                },
            }
        }
    }
}

/// Reads from `reader` until `buf` is full or EOF; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Buffered byte-by-byte comparison of two files to EOF.
fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    let mut reader_a = BufReader::new(File::open(a)?);
    let mut reader_b = BufReader::new(File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n_a = read_full(&mut reader_a, &mut buf_a)?;
        let n_b = read_full(&mut reader_b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}
