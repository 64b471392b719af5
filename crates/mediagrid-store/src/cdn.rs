//! The engine: boots the root layout, wires the replicator, runs the
//! start-up integrity check, and implements find-or-add.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::content_type::ContentType;
use crate::fsck::{self, FsckReport, Severity};
use crate::replicate::{Csync2, Replicator};
use crate::resources::{Resources, RESOURCES_DIR_NAME};
use crate::uploads::{UploadFile, Uploads, UPLOADS_DIR_NAME};
use crate::version::Version;
use crate::{fs_util, CdnError, Result, EXTENSION_SEPARATOR};

/// Access to the CDN data of one peer.
///
/// The data lives directly in the filesystem, with csync2 in multi-master
/// mode replicating committed changes between peers.  The root directory
/// should not be inside any web root; the front-end dispatches to
/// resources after URL rewriting and access control, while back-end
/// components interact with this engine directly.
pub struct CdnData {
    root: PathBuf,
    replicator: Arc<dyn Replicator>,
    resources: Resources,
    uploads: Option<Uploads>,
}

impl CdnData {
    /// Opens the CDN data at `root`, creating the directory layout as
    /// needed, and runs the start-up integrity check.
    ///
    /// `csync2_group` is the replication group to synchronise after each
    /// change; `None` or empty disables replication.  Only uploader peers
    /// create the `uploads/` area and accept new resources.
    ///
    /// Fails with [`CdnError::FsckSevere`] when the start-up check finds
    /// any severe issue.
    pub fn open(root: &Path, csync2_group: Option<&str>, uploader: bool) -> Result<Self> {
        Self::open_with_replicator(root, Arc::new(Csync2::new(csync2_group)), uploader)
    }

    /// Opens the CDN data with a caller-provided replicator.
    pub fn open_with_replicator(
        root: &Path,
        replicator: Arc<dyn Replicator>,
        uploader: bool,
    ) -> Result<Self> {
        // Never replicate the root itself
        let root = fs_util::make_directory_if_needed(None, root, true)?;
        // Canonical form, so paths stay comparable after following the
        // original.* symlinks
        let root = fs::canonicalize(&root)?;
        let resources_dir = fs_util::make_directory_if_needed(
            Some(replicator.as_ref()),
            &root.join(RESOURCES_DIR_NAME),
            false,
        )?;
        let resources = Resources::new(resources_dir, replicator.clone());
        let uploads = if uploader {
            // The uploads directory is not replicated
            let uploads_dir =
                fs_util::make_directory_if_needed(None, &root.join(UPLOADS_DIR_NAME), false)?;
            Some(Uploads::new(root.clone(), uploads_dir))
        } else {
            None
        };
        let cdn = CdnData {
            root,
            replicator,
            resources,
            uploads,
        };

        let report = fsck::run(&cdn, true);
        for (path, issue) in report.iter() {
            match issue.severity() {
                Severity::Severe => error!(path = %path.display(), "{issue}"),
                Severity::Warning => warn!(path = %path.display(), "{issue}"),
                Severity::Info => info!(path = %path.display(), "{issue}"),
            }
        }
        let severe = report.severe_count();
        if severe > 0 {
            return Err(CdnError::FsckSevere { severe });
        }
        Ok(cdn)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// The uploads handler of this peer.
    ///
    /// Fails with [`CdnError::InvalidState`] when this peer is not an
    /// uploader.
    pub fn uploads(&self) -> Result<&Uploads> {
        self.uploads
            .as_ref()
            .ok_or_else(|| CdnError::InvalidState("uploads disabled".into()))
    }

    pub(crate) fn uploads_if_enabled(&self) -> Option<&Uploads> {
        self.uploads.as_ref()
    }

    pub fn is_uploader(&self) -> bool {
        self.uploads.is_some()
    }

    pub(crate) fn replicator(&self) -> &dyn Replicator {
        self.replicator.as_ref()
    }

    /// Runs a runtime integrity check, taking shared locks and making no
    /// filesystem modifications.
    pub fn fsck(&self) -> FsckReport {
        fsck::run(self, false)
    }

    /// Stores a new file, or finds a byte-equal existing version.
    ///
    /// Every existing resource whose original content type matches the
    /// declared type is searched first, with a full byte-by-byte
    /// comparison.  On a match the existing version is returned, which may
    /// be a higher quality copy of the same content than the one deposited
    /// earlier; either way the returned version is immediately available
    /// at its resolution without on-demand scaling.
    ///
    /// The upload handle is consumed, and its underlying temp file no
    /// longer exists when this returns, on success and on failure alike.
    pub fn find_or_add(&self, upload_file: &UploadFile) -> Result<Version> {
        if upload_file.cdn_root() != self.root {
            return Err(CdnError::BadArgument(format!(
                "upload file is for a different CDN: this = {}, upload = {}",
                self.root.display(),
                upload_file.cdn_root().display()
            )));
        }
        let Some(temp_file) = upload_file.take_temp_file() else {
            return Err(CdnError::BadArgument(
                "upload file already stored (or a previous store attempt failed)".into(),
            ));
        };
        let result = self.find_or_add_file(&temp_file, upload_file.content_type());
        // The staging file never survives the operation; on the deposit
        // path it was already moved into the resource directory.
        if let Err(e) = fs::remove_file(&temp_file) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp_file.display(), "unable to remove upload temp file: {e}");
            }
        }
        result
    }

    fn find_or_add_file(&self, temp_file: &Path, content_type: ContentType) -> Result<Version> {
        // Verify extension
        let expected_extension = content_type.extension();
        let temp_file_name = fs_util::file_name(temp_file);
        if !temp_file_name.ends_with(&format!("{EXTENSION_SEPARATOR}{expected_extension}")) {
            return Err(CdnError::BadArgument(format!(
                "upload file has mismatched extension: expected {expected_extension}, \
                 but filename is {temp_file_name}"
            )));
        }
        // Verify regular file
        let meta = fs::symlink_metadata(temp_file)?;
        if !meta.is_file() {
            return Err(CdnError::BadArgument(format!(
                "upload file is not a regular file: {}",
                temp_file.display()
            )));
        }
        self.verify_declared_type(temp_file, temp_file_name, content_type)?;

        // Sweep all existing resources for a byte-equal match.  Committed
        // resources are immutable, so no locking is needed; two concurrent
        // deposits of identical bytes may both miss and each commit a
        // distinct resource, which is acceptable.
        let temp_file_size = meta.len();
        for resource in self.resources.iter()? {
            let resource = resource?;
            // The match must be against the original link type, so a jpg
            // thumbnail derived from a future video type is not matched
            let original_content_type = resource.original_content_type()?;
            if original_content_type == content_type {
                if let Some(version) =
                    resource.find_version(temp_file, temp_file_size, content_type)?
                {
                    return Ok(version);
                }
            }
        }
        let new_resource =
            self.resources
                .add_new_resource(temp_file, temp_file_size, content_type)?;
        new_resource.original()
    }

    /// Checks that a probed MIME does not contradict the declared type:
    /// magic-byte sniffing first, then a probe by filename extension.
    /// When both are inconclusive the declaration is accepted.
    fn verify_declared_type(
        &self,
        temp_file: &Path,
        temp_file_name: &str,
        content_type: ContentType,
    ) -> Result<()> {
        let mut head = [0u8; 64];
        let mut reader = File::open(temp_file)?;
        let mut filled = 0;
        while filled < head.len() {
            let n = reader.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if let Some(sniffed) = ContentType::sniff(&head[..filled]) {
            if sniffed != content_type {
                return Err(CdnError::BadArgument(format!(
                    "sniffed content type does not match declared content type: \
                     sniffed = {}, declared = {}",
                    sniffed.mime(),
                    content_type.mime()
                )));
            }
            return Ok(());
        }
        let probed = temp_file_name
            .rsplit_once(EXTENSION_SEPARATOR)
            .and_then(|(_, ext)| ContentType::for_extension(ext).ok());
        if let Some(probed) = probed {
            if probed != content_type {
                return Err(CdnError::BadArgument(format!(
                    "probed content type does not match declared content type: \
                     probed = {}, declared = {}",
                    probed.mime(),
                    content_type.mime()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CdnData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnData")
            .field("root", &self.root)
            .field("uploader", &self.is_uploader())
            .finish()
    }
}

impl std::fmt::Display for CdnData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root.display())
    }
}
