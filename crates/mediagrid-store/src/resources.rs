//! The resources hash tree: identifier allocation, the deposit protocol,
//! lazy iteration, and the whole-tree integrity check.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, trace, warn};

use crate::content_type::ContentType;
use crate::fsck::{FsckContext, FsckIssue, Severity};
use crate::lock::{DirectoryLock, LOCK_FILE};
use crate::naming::{self, ResourceId};
use crate::replicate::Replicator;
use crate::resource::{Resource, ORIGINAL_PREFIX};
use crate::{fs_util, CdnError, Result, EXTENSION_SEPARATOR, NEW_EXTENSION};

pub(crate) const RESOURCES_DIR_NAME: &str = "resources";

/// Only one new identifier is allocated at a time: availability is
/// determined by the presence of `<resource>/` or `<resource>.new/`, so
/// two threads drawing concurrently could claim the same identifier
/// before the filesystem observes either claim.
static NEW_ID_LOCK: Mutex<()> = Mutex::new(());

fn exists_nofollow(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_dir_nofollow(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Manages access through the resources hash directories.
#[derive(Clone)]
pub struct Resources {
    dir: PathBuf,
    replicator: Arc<dyn Replicator>,
}

impl Resources {
    pub(crate) fn new(dir: PathBuf, replicator: Arc<dyn Replicator>) -> Self {
        Resources { dir, replicator }
    }

    /// Locks the entire set of resources.  Held exclusively, this allows
    /// an atomic check for an existing resource before adding a new one;
    /// without it a resource could be duplicated on concurrent addition.
    pub(crate) fn lock(&self, shared: bool) -> io::Result<DirectoryLock> {
        DirectoryLock::acquire(&self.dir, shared)
    }

    /// Gets a resource by its unique identifier, or `None` when any level
    /// of its path is missing.  A non-directory where a directory is
    /// expected is logged and treated as missing.
    pub fn get(&self, id: ResourceId) -> Result<Option<Resource>> {
        let hash1_dir = self.dir.join(id.hash1_name());
        if !exists_nofollow(&hash1_dir)? {
            return Ok(None);
        }
        if !is_dir_nofollow(&hash1_dir) {
            warn!(path = %hash1_dir.display(), "skipping non-directory in hash directory level 1");
            return Ok(None);
        }
        let hash2_dir = hash1_dir.join(id.hash2_name());
        if !exists_nofollow(&hash2_dir)? {
            return Ok(None);
        }
        if !is_dir_nofollow(&hash2_dir) {
            warn!(path = %hash2_dir.display(), "skipping non-directory in hash directory level 2");
            return Ok(None);
        }
        let resource_dir = hash2_dir.join(id.resource_name());
        if !exists_nofollow(&resource_dir)? {
            return Ok(None);
        }
        if !is_dir_nofollow(&resource_dir) {
            warn!(path = %resource_dir.display(), "skipping non-directory for resource directory");
            return Ok(None);
        }
        Ok(Some(Resource::new(
            id,
            resource_dir,
            self.replicator.clone(),
        )))
    }

    /// Lazily iterates all committed resources.  Order is
    /// filesystem-dependent and not specified; each committed resource is
    /// produced exactly once.
    pub fn iter(&self) -> Result<ResourceIter> {
        Ok(ResourceIter {
            resources: self.clone(),
            hash1_iter: fs::read_dir(&self.dir)?,
            hash1_value: 0,
            hash2_iter: None,
            hash2_value: 0,
            resource_iter: None,
        })
    }

    /// Adds a new resource using the given upload temp file as the
    /// original version.
    ///
    /// Holds an exclusive lock on the resources root for the whole
    /// protocol; new resources are only introduced by back-office
    /// administrators, so contention is not a concern.  The lock is
    /// released before the cluster is synchronised.
    pub(crate) fn add_new_resource(
        &self,
        temp_file: &Path,
        temp_file_size: u64,
        content_type: ContentType,
    ) -> Result<Resource> {
        let sync_path;
        let resource;
        {
            let _lock = self.lock(false)?;
            let (id, resource_dir, resource_new_dir, new_sync_path) = self.allocate_id()?;
            sync_path = new_sync_path;
            resource = Resource::new(id, resource_dir.clone(), self.replicator.clone());
            // Determine the versioned content type and filename
            let original_version = content_type.version_by_read_file(&resource, temp_file)?;
            let version_filename = original_version.filename();
            let version_file = resource_new_dir.join(&version_filename);
            fs_util::move_into_place(temp_file, &version_file)?;
            // Relative symlink to original.<extension>
            let original_link = resource_new_dir.join(format!(
                "{ORIGINAL_PREFIX}{EXTENSION_SEPARATOR}{}",
                content_type.extension()
            ));
            std::os::unix::fs::symlink(&version_filename, &original_link)?;
            // A size change before the move into place indicates the
            // caller kept writing the upload file
            let committed_size = fs::symlink_metadata(&version_file)?.len();
            if committed_size != temp_file_size {
                return Err(CdnError::ConcurrentModification {
                    path: version_file,
                    expected: temp_file_size,
                    actual: committed_size,
                });
            }
            // Move the resource into place
            fs::rename(&resource_new_dir, &resource_dir)?;
        }
        self.replicator.replicate(&[sync_path]);
        Ok(resource)
    }

    /// Draws identifiers from the process-wide secure RNG until one is
    /// free, creating any missing hash directories and the `<resource>.new/`
    /// staging directory.
    ///
    /// Returns the identifier, the final resource directory (not yet
    /// existing), the staging directory (created), and the highest newly
    /// created ancestor for replication.
    fn allocate_id(&self) -> Result<(ResourceId, PathBuf, PathBuf, PathBuf)> {
        let _alloc = NEW_ID_LOCK.lock().unwrap();
        loop {
            let mut sync_path: Option<PathBuf> = None;
            let id = ResourceId(OsRng.next_u64());
            let hash1_dir = self.dir.join(id.hash1_name());
            if !exists_nofollow(&hash1_dir)? {
                fs_util::make_directory(&hash1_dir)?;
                sync_path = Some(hash1_dir.clone());
            } else if !is_dir_nofollow(&hash1_dir) {
                warn!(
                    path = %hash1_dir.display(),
                    "discarding possible id due to non-directory in hash directory level 1"
                );
                continue;
            }
            let hash2_dir = hash1_dir.join(id.hash2_name());
            if !exists_nofollow(&hash2_dir)? {
                fs_util::make_directory(&hash2_dir)?;
                if sync_path.is_none() {
                    sync_path = Some(hash2_dir.clone());
                }
            } else if !is_dir_nofollow(&hash2_dir) {
                warn!(
                    path = %hash2_dir.display(),
                    "discarding possible id due to non-directory in hash directory level 2"
                );
                continue;
            }
            let resource_name = id.resource_name();
            let resource_dir = hash2_dir.join(&resource_name);
            if exists_nofollow(&resource_dir)? {
                info!(
                    path = %resource_dir.display(),
                    "discarding id since already used by resource directory"
                );
                continue;
            }
            let resource_new_dir = hash2_dir.join(format!(
                "{resource_name}{EXTENSION_SEPARATOR}{NEW_EXTENSION}"
            ));
            if exists_nofollow(&resource_new_dir)? {
                info!(
                    path = %resource_new_dir.display(),
                    "discarding id since already used by new resource directory"
                );
                continue;
            }
            fs_util::make_directory(&resource_new_dir)?;
            let sync_path = sync_path.unwrap_or_else(|| resource_dir.clone());
            return Ok((id, resource_dir, resource_new_dir, sync_path));
        }
    }

    /// Integrity check over the whole hash tree.  Locks the resources
    /// directory shared for runtime checks and exclusive at start-up.
    pub(crate) fn fsck_resources_directories(&self, ctx: &mut FsckContext) {
        let _lock = match self.lock(ctx.lock_shared()) {
            Ok(lock) => lock,
            Err(e) => {
                ctx.put(
                    self.dir.clone(),
                    FsckIssue::with_cause(
                        Severity::Severe,
                        e,
                        "Unable to lock resources directory",
                    ),
                );
                return;
            }
        };
        match fs_util::list(&self.dir) {
            Ok(paths) => {
                for hash1_dir in paths {
                    if fs_util::file_name(&hash1_dir) != LOCK_FILE {
                        self.fsck_hash1_dir(ctx, &hash1_dir);
                    }
                }
            }
            Err(e) => ctx.put(
                self.dir.clone(),
                FsckIssue::with_cause(Severity::Severe, e, "Unable to list resources directory"),
            ),
        }
    }

    fn fsck_hash1_dir(&self, ctx: &mut FsckContext, hash1_dir: &Path) {
        let Ok(hash1_value) = naming::parse_hash1_name(fs_util::file_name(hash1_dir)) else {
            ctx.put(
                hash1_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Unexpected name for hash directory level 1"),
            );
            return;
        };
        if !is_dir_nofollow(hash1_dir) {
            ctx.put(
                hash1_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Non-directory in hash directory level 1"),
            );
            return;
        }
        match fs_util::list(hash1_dir) {
            Ok(paths) => {
                for hash2_dir in paths {
                    self.fsck_hash2_dir(ctx, hash1_value, &hash2_dir);
                }
            }
            Err(e) => {
                ctx.put(
                    hash1_dir.to_path_buf(),
                    FsckIssue::with_cause(
                        Severity::Severe,
                        e,
                        "Unable to list hash directory level 1",
                    ),
                );
                return;
            }
        }
        // Prune when now empty
        match fs_util::list(hash1_dir) {
            Ok(paths) if paths.is_empty() => {
                if ctx.repair() {
                    match fs::remove_dir(hash1_dir) {
                        Ok(()) => {
                            ctx.put(
                                hash1_dir.to_path_buf(),
                                FsckIssue::new(
                                    Severity::Info,
                                    "Deleted empty hash directory level 1",
                                ),
                            );
                            ctx.coalesce_sync_paths(hash1_dir);
                        }
                        Err(e) => ctx.put(
                            hash1_dir.to_path_buf(),
                            FsckIssue::with_cause(
                                Severity::Severe,
                                e,
                                "Unable to delete empty hash directory level 1",
                            ),
                        ),
                    }
                } else {
                    ctx.put(
                        hash1_dir.to_path_buf(),
                        FsckIssue::new(Severity::Info, "Found empty hash directory level 1"),
                    );
                }
            }
            Ok(_) => {}
            Err(e) => ctx.put(
                hash1_dir.to_path_buf(),
                FsckIssue::with_cause(Severity::Severe, e, "Unable to list hash directory level 1"),
            ),
        }
    }

    fn fsck_hash2_dir(&self, ctx: &mut FsckContext, hash1_value: u64, hash2_dir: &Path) {
        let Ok(hash2_value) = naming::parse_hash2_name(fs_util::file_name(hash2_dir)) else {
            ctx.put(
                hash2_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Unexpected name for hash directory level 2"),
            );
            return;
        };
        if !is_dir_nofollow(hash2_dir) {
            ctx.put(
                hash2_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Non-directory in hash directory level 2"),
            );
            return;
        }
        match fs_util::list(hash2_dir) {
            Ok(paths) => {
                for resource_dir in paths {
                    self.fsck_resource_dir(ctx, hash1_value, hash2_value, &resource_dir);
                }
            }
            Err(e) => {
                ctx.put(
                    hash2_dir.to_path_buf(),
                    FsckIssue::with_cause(
                        Severity::Severe,
                        e,
                        "Unable to list hash directory level 2",
                    ),
                );
                return;
            }
        }
        // Prune when now empty
        match fs_util::list(hash2_dir) {
            Ok(paths) if paths.is_empty() => {
                if ctx.repair() {
                    match fs::remove_dir(hash2_dir) {
                        Ok(()) => {
                            ctx.put(
                                hash2_dir.to_path_buf(),
                                FsckIssue::new(
                                    Severity::Info,
                                    "Deleted empty hash directory level 2",
                                ),
                            );
                            ctx.add_sync_path(hash2_dir.to_path_buf());
                        }
                        Err(e) => ctx.put(
                            hash2_dir.to_path_buf(),
                            FsckIssue::with_cause(
                                Severity::Severe,
                                e,
                                "Unable to delete empty hash directory level 2",
                            ),
                        ),
                    }
                } else {
                    ctx.put(
                        hash2_dir.to_path_buf(),
                        FsckIssue::new(Severity::Info, "Found empty hash directory level 2"),
                    );
                }
            }
            Ok(_) => {}
            Err(e) => ctx.put(
                hash2_dir.to_path_buf(),
                FsckIssue::with_cause(Severity::Severe, e, "Unable to list hash directory level 2"),
            ),
        }
    }

    fn fsck_resource_dir(
        &self,
        ctx: &mut FsckContext,
        hash1_value: u64,
        hash2_value: u64,
        resource_dir: &Path,
    ) {
        if !is_dir_nofollow(resource_dir) {
            ctx.put(
                resource_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Non-directory for resource directory"),
            );
            return;
        }
        let resource_dir_name = fs_util::file_name(resource_dir);
        if naming::is_new_resource_dir(resource_dir_name) {
            if ctx.repair() {
                self.remove_new_resource_dir(ctx, resource_dir);
            } else {
                // TODO: Upgrade to warning for *.new older than a certain time frame
                ctx.put(
                    resource_dir.to_path_buf(),
                    FsckIssue::new(Severity::Info, "Skipping new resource directory"),
                );
            }
            return;
        }
        match naming::parse_resource_name(resource_dir_name) {
            Ok(resource_value) => {
                let id = ResourceId::from_fields(hash1_value, hash2_value, resource_value);
                Resource::new(id, resource_dir.to_path_buf(), self.replicator.clone())
                    .fsck_resource(ctx);
            }
            Err(_) => ctx.put(
                resource_dir.to_path_buf(),
                FsckIssue::new(Severity::Warning, "Unexpected name for resource directory"),
            ),
        }
    }

    /// Removes a crashed deposit's staging directory.  The staging
    /// directory never contains sub-directories, so deletion is one level
    /// deep.
    fn remove_new_resource_dir(&self, ctx: &mut FsckContext, resource_dir: &Path) {
        let files = match fs_util::list(resource_dir) {
            Ok(files) => files,
            Err(e) => {
                ctx.put(
                    resource_dir.to_path_buf(),
                    FsckIssue::with_cause(
                        Severity::Severe,
                        e,
                        "Unable to list new resource directory",
                    ),
                );
                return;
            }
        };
        let mut delete_resource_dir = true;
        for file in files {
            match fs::remove_file(&file) {
                Ok(()) => ctx.put(
                    file,
                    FsckIssue::new(Severity::Info, "Deleted new resource file"),
                ),
                Err(e) => {
                    ctx.put(
                        file,
                        FsckIssue::with_cause(
                            Severity::Severe,
                            e,
                            "Unable to delete new resource file",
                        ),
                    );
                    delete_resource_dir = false;
                }
            }
        }
        if delete_resource_dir {
            match fs::remove_dir(resource_dir) {
                Ok(()) => ctx.put(
                    resource_dir.to_path_buf(),
                    FsckIssue::new(Severity::Info, "Deleted new resource directory"),
                ),
                Err(e) => ctx.put(
                    resource_dir.to_path_buf(),
                    FsckIssue::with_cause(
                        Severity::Severe,
                        e,
                        "Unable to delete new resource directory",
                    ),
                ),
            }
        }
    }
}

/// Pull-based iterator over committed resources, holding one open
/// directory handle per level.
pub struct ResourceIter {
    resources: Resources,
    hash1_iter: fs::ReadDir,
    hash1_value: u64,
    hash2_iter: Option<fs::ReadDir>,
    hash2_value: u64,
    resource_iter: Option<fs::ReadDir>,
}

impl Iterator for ResourceIter {
    type Item = Result<Resource>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Innermost: resource directories
            if let Some(iter) = &mut self.resource_iter {
                match iter.next() {
                    Some(Ok(entry)) => {
                        let path = entry.path();
                        if !is_dir_nofollow(&path) {
                            trace!(path = %path.display(), "skipping non-directory for resource directory");
                            continue;
                        }
                        let name = fs_util::file_name(&path).to_owned();
                        if naming::is_new_resource_dir(&name) {
                            debug!(path = %path.display(), "skipping new resource directory");
                            continue;
                        }
                        match naming::parse_resource_name(&name) {
                            Ok(resource_value) => {
                                let id = ResourceId::from_fields(
                                    self.hash1_value,
                                    self.hash2_value,
                                    resource_value,
                                );
                                trace!(%id, path = %path.display(), "returning resource");
                                return Some(Ok(Resource::new(
                                    id,
                                    path,
                                    self.resources.replicator.clone(),
                                )));
                            }
                            Err(_) => {
                                warn!(path = %path.display(), "skipping unexpected name for resource directory");
                                continue;
                            }
                        }
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => self.resource_iter = None,
                }
                continue;
            }
            // Middle: hash2 directories
            if let Some(iter) = &mut self.hash2_iter {
                match iter.next() {
                    Some(Ok(entry)) => {
                        let path = entry.path();
                        match naming::parse_hash2_name(fs_util::file_name(&path)) {
                            Ok(value) => {
                                if !is_dir_nofollow(&path) {
                                    warn!(path = %path.display(), "skipping non-directory in hash directory level 2");
                                    continue;
                                }
                                self.hash2_value = value;
                                match fs::read_dir(&path) {
                                    Ok(rd) => self.resource_iter = Some(rd),
                                    Err(e) => return Some(Err(e.into())),
                                }
                            }
                            Err(_) => {
                                warn!(path = %path.display(), "skipping unexpected name for hash directory level 2");
                            }
                        }
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => self.hash2_iter = None,
                }
                continue;
            }
            // Outermost: hash1 directories
            match self.hash1_iter.next() {
                Some(Ok(entry)) => {
                    let path = entry.path();
                    let name = fs_util::file_name(&path).to_owned();
                    if name == LOCK_FILE {
                        continue;
                    }
                    match naming::parse_hash1_name(&name) {
                        Ok(value) => {
                            if !is_dir_nofollow(&path) {
                                warn!(path = %path.display(), "skipping non-directory in hash directory level 1");
                                continue;
                            }
                            self.hash1_value = value;
                            match fs::read_dir(&path) {
                                Ok(rd) => self.hash2_iter = Some(rd),
                                Err(e) => return Some(Err(e.into())),
                            }
                        }
                        Err(_) => {
                            warn!(path = %path.display(), "skipping unexpected name for hash directory level 1");
                        }
                    }
                }
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }
}
