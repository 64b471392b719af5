//! The upload staging area.
//!
//! Upload files start inside `uploads/` on the same filesystem as the
//! resources tree, so a committed deposit can move the data into place
//! instead of copying it.  The directory exists only on uploader peers and
//! is excluded from csync2 replication.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::content_type::ContentType;
use crate::fsck::{FsckIssue, FsckReport, Severity};
use crate::{fs_util, Result, EXTENSION_SEPARATOR};

pub(crate) const UPLOADS_DIR_NAME: &str = "uploads";

/// Manages the uploads directory of an uploader peer.
pub struct Uploads {
    cdn_root: PathBuf,
    dir: PathBuf,
}

impl Uploads {
    pub(crate) fn new(cdn_root: PathBuf, dir: PathBuf) -> Self {
        Uploads { cdn_root, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a new, empty upload file carrying the extension of the
    /// given content type.  The caller writes the payload into
    /// [`UploadFile::temp_file`] and then hands the handle to
    /// [`CdnData::find_or_add`](crate::CdnData::find_or_add).
    ///
    /// When writing the payload it is suggested to flush and `sync_all`
    /// before depositing.
    pub fn create_upload_file(&self, content_type: ContentType) -> Result<UploadFile> {
        let temp = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&format!(
                "{EXTENSION_SEPARATOR}{}",
                content_type.extension()
            ))
            .tempfile_in(&self.dir)?;
        let (file, path) = temp.keep().map_err(|e| e.error)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(crate::fs_util::NEW_FILE_MODE))?;
        }
        drop(file);
        Ok(UploadFile {
            cdn_root: self.cdn_root.clone(),
            content_type,
            temp_file: Mutex::new(Some(path)),
        })
    }

    /// Sweeps the uploads directory: at start-up, stale upload files with a
    /// supported extension are deleted; anything else is reported.
    pub(crate) fn fsck_uploads_directory(&self, startup: bool, report: &mut FsckReport) {
        let files = match fs_util::list(&self.dir) {
            Ok(files) => files,
            Err(e) => {
                report.put(
                    self.dir.clone(),
                    FsckIssue::with_cause(Severity::Severe, e, "Unable to list uploads directory"),
                );
                return;
            }
        };
        for upload_file in files {
            let is_file = fs::symlink_metadata(&upload_file)
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                report.put(
                    upload_file,
                    FsckIssue::new(Severity::Warning, "Non-file in uploads directory"),
                );
            } else if startup {
                // Only delete when carrying an expected extension
                let file_name = fs_util::file_name(&upload_file);
                let expected = ContentType::ALL.into_iter().any(|ct| {
                    file_name.ends_with(&format!("{EXTENSION_SEPARATOR}{}", ct.extension()))
                });
                if expected {
                    if let Err(e) = fs::remove_file(&upload_file) {
                        report.put(
                            upload_file,
                            FsckIssue::with_cause(
                                Severity::Severe,
                                e,
                                "Unable to delete file in uploads directory",
                            ),
                        );
                    }
                } else {
                    report.put(
                        upload_file,
                        FsckIssue::new(Severity::Warning, "Unexpected file in uploads directory"),
                    );
                }
            }
        }
    }
}

/// A file being uploaded, possibly still partial.
///
/// The handle is consumed exactly once by
/// [`CdnData::find_or_add`](crate::CdnData::find_or_add); the payload must
/// not be modified after being handed over.
pub struct UploadFile {
    cdn_root: PathBuf,
    content_type: ContentType,
    temp_file: Mutex<Option<PathBuf>>,
}

impl UploadFile {
    /// The engine root this upload file belongs to.
    pub(crate) fn cdn_root(&self) -> &Path {
        &self.cdn_root
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// The underlying temp file, or `None` once the handle has been
    /// consumed.
    pub fn temp_file(&self) -> Option<PathBuf> {
        self.temp_file.lock().unwrap().clone()
    }

    /// Atomically takes the temp file, leaving `None` behind.
    pub(crate) fn take_temp_file(&self) -> Option<PathBuf> {
        self.temp_file.lock().unwrap().take()
    }

    /// Abandons the upload, removing the underlying temp file if the
    /// handle had not been consumed.
    pub fn discard(&self) {
        if let Some(path) = self.take_temp_file() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "unable to remove abandoned upload: {e}");
                }
            }
        }
    }
}
