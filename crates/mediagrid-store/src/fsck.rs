//! Filesystem integrity checking.
//!
//! The same traversal serves read-only runtime checks and start-up repair:
//! at start-up, stray `*.new` staging paths are removed, empty hash
//! directories pruned, and the uploads area cleared.  Deleted paths are
//! collected so the cluster can be told about them once the sweep ends.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cdn::CdnData;
use crate::fs_util;
use crate::lock::LOCK_FILE;
use crate::resources::RESOURCES_DIR_NAME;
use crate::uploads::UPLOADS_DIR_NAME;
use crate::CdnError;

/// How bad one fsck finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Severe,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Severe => "SEVERE",
        })
    }
}

/// One finding for one path.
#[derive(Debug)]
pub struct FsckIssue {
    severity: Severity,
    message: String,
    cause: Option<CdnError>,
}

impl FsckIssue {
    pub(crate) fn new(severity: Severity, message: impl Into<String>) -> Self {
        FsckIssue {
            severity,
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn with_cause(
        severity: Severity,
        cause: impl Into<CdnError>,
        message: impl Into<String>,
    ) -> Self {
        FsckIssue {
            severity,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&CdnError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}: {}", self.severity, self.message, cause),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// All findings of one fsck pass, at most one per path.
#[derive(Debug, Default)]
pub struct FsckReport {
    issues: BTreeMap<PathBuf, FsckIssue>,
}

impl FsckReport {
    pub(crate) fn put(&mut self, path: PathBuf, issue: FsckIssue) {
        let previous = self.issues.insert(path.clone(), issue);
        debug_assert!(
            previous.is_none(),
            "more than one issue added for {}",
            path.display()
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &FsckIssue)> {
        self.issues.iter().map(|(p, i)| (p.as_path(), i))
    }

    pub fn get(&self, path: &Path) -> Option<&FsckIssue> {
        self.issues.get(path)
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Number of issues at [`Severity::Severe`].
    pub fn severe_count(&self) -> usize {
        self.issues
            .values()
            .filter(|i| i.severity() == Severity::Severe)
            .count()
    }

    /// The worst severity present, when any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.values().map(FsckIssue::severity).max()
    }
}

/// Traversal state threaded through one fsck pass.
pub(crate) struct FsckContext {
    pub(crate) report: FsckReport,
    /// Paths whose deletion must be replicated; `Some` only at start-up.
    sync_paths: Option<BTreeSet<PathBuf>>,
    /// Whether this pass may modify the filesystem (start-up on an
    /// uploader peer).
    repair: bool,
}

impl FsckContext {
    pub(crate) fn new(startup: bool, uploader: bool) -> Self {
        FsckContext {
            report: FsckReport::default(),
            sync_paths: startup.then(BTreeSet::new),
            repair: startup && uploader,
        }
    }

    /// Start-up passes take exclusive locks; runtime passes shared.
    pub(crate) fn lock_shared(&self) -> bool {
        self.sync_paths.is_none()
    }

    pub(crate) fn repair(&self) -> bool {
        self.repair
    }

    pub(crate) fn put(&mut self, path: impl Into<PathBuf>, issue: FsckIssue) {
        self.report.put(path.into(), issue);
    }

    pub(crate) fn add_sync_path(&mut self, path: PathBuf) {
        if let Some(paths) = &mut self.sync_paths {
            paths.insert(path);
        }
    }

    /// Replaces all recorded sync paths under `ancestor` with `ancestor`
    /// itself, after the whole subtree was deleted.
    pub(crate) fn coalesce_sync_paths(&mut self, ancestor: &Path) {
        if let Some(paths) = &mut self.sync_paths {
            paths.retain(|p| !p.starts_with(ancestor));
            paths.insert(ancestor.to_path_buf());
        }
    }

    fn take_sync_paths(&mut self) -> Vec<PathBuf> {
        self.sync_paths
            .take()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Performs a filesystem integrity check over the whole engine.
pub(crate) fn run(cdn: &CdnData, startup: bool) -> FsckReport {
    let mut ctx = FsckContext::new(startup, cdn.is_uploader());
    cdn.resources().fsck_resources_directories(&mut ctx);
    let sync_paths = ctx.take_sync_paths();
    if !sync_paths.is_empty() {
        cdn.replicator().replicate(&sync_paths);
    }

    if let Some(uploads) = cdn.uploads_if_enabled() {
        uploads.fsck_uploads_directory(startup, &mut ctx.report);
    }

    // Anything else in the root is unexpected
    match fs_util::list(cdn.root()) {
        Ok(paths) => {
            for path in paths {
                let name = fs_util::file_name(&path);
                if name != RESOURCES_DIR_NAME && name != UPLOADS_DIR_NAME && name != LOCK_FILE {
                    ctx.report.put(
                        path,
                        FsckIssue::new(Severity::Warning, "Unexpected path in CDN root"),
                    );
                }
            }
        }
        Err(e) => {
            ctx.report.put(
                cdn.root().to_path_buf(),
                FsckIssue::with_cause(Severity::Severe, e, "Unable to list CDN root directory"),
            );
        }
    }
    ctx.report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Severe);
    }

    #[test]
    fn report_counts_severe() {
        let mut report = FsckReport::default();
        report.put(
            PathBuf::from("/a"),
            FsckIssue::new(Severity::Info, "informational"),
        );
        report.put(
            PathBuf::from("/b"),
            FsckIssue::new(Severity::Severe, "broken"),
        );
        assert_eq!(report.len(), 2);
        assert_eq!(report.severe_count(), 1);
        assert_eq!(report.max_severity(), Some(Severity::Severe));
    }

    #[test]
    fn coalesce_replaces_descendants() {
        let mut ctx = FsckContext::new(true, true);
        ctx.add_sync_path(PathBuf::from("/root/ab/cd"));
        ctx.add_sync_path(PathBuf::from("/root/ab/ef"));
        ctx.add_sync_path(PathBuf::from("/root/zz"));
        ctx.coalesce_sync_paths(Path::new("/root/ab"));
        assert_eq!(
            ctx.take_sync_paths(),
            vec![PathBuf::from("/root/ab"), PathBuf::from("/root/zz")]
        );
    }
}
