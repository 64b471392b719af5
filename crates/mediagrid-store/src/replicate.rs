//! Cluster replication boundary.
//!
//! After each committed mutation the engine hands the affected paths to a
//! [`Replicator`].  The production implementation shells out to csync2 in
//! multi-master mode; the following are excluded from replication by the
//! csync2 configuration (documented here as contract):
//!
//! - the `uploads/` subtree
//! - any `*.new` path
//! - `.lock` files
//!
//! Replication is best-effort: failures are logged and otherwise ignored,
//! with cluster-state monitoring expected to catch persistent problems.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

/// Propagates committed filesystem changes to the peer cluster.
pub trait Replicator: Send + Sync {
    /// Immediately synchronises the cluster for the given paths.
    ///
    /// Paths need not exist (a deletion is synchronised the same way).
    /// When `paths` is empty, nothing is done.
    fn replicate(&self, paths: &[PathBuf]);
}

/// One lock object per distinct csync2 group, so that only one csync2
/// invocation runs per group within this process.
static GROUP_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn group_lock(group: &str) -> Arc<Mutex<()>> {
    let mut locks = GROUP_LOCKS.lock().unwrap();
    locks.entry(group.to_string()).or_default().clone()
}

/// Replicator backed by the csync2 binary.
///
/// A simple `csync2 -x -r <path>` marks paths dirty but does not reliably
/// schedule the update phase, so synchronisation is split into three
/// steps: hint the specific paths (`-h -r`), check hinted paths to mark
/// them dirty (`-c`), then update everything dirty (`-u`).
pub struct Csync2 {
    group: Option<String>,
}

impl Csync2 {
    /// Creates a new synchroniser for the given group.  When the group is
    /// `None` or empty after trimming, replication is a no-op.
    pub fn new(group: Option<&str>) -> Self {
        let group = group
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_owned);
        Csync2 { group }
    }

    /// Runs one csync2 invocation, logging output; returns success.
    fn run(args: &[&str]) -> bool {
        let joined = format!("csync2 {}", args.join(" "));
        match Command::new("csync2").args(args).output() {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.is_empty() {
                    info!(command = %joined, "standard output: {}", stdout.trim_end());
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    if !stderr.is_empty() {
                        warn!(command = %joined, "standard error: {}", stderr.trim_end());
                    }
                    true
                } else {
                    if stderr.is_empty() {
                        error!(command = %joined, status = %output.status, "csync2 failed");
                    } else {
                        error!(
                            command = %joined,
                            status = %output.status,
                            "csync2 failed, standard error: {}",
                            stderr.trim_end()
                        );
                    }
                    false
                }
            }
            Err(e) => {
                error!(command = %joined, "unable to launch csync2: {e}");
                false
            }
        }
    }
}

impl Replicator for Csync2 {
    fn replicate(&self, paths: &[PathBuf]) {
        if paths.is_empty() {
            return;
        }
        let Some(group) = &self.group else {
            debug!(?paths, "no cluster to synchronize");
            return;
        };
        debug!(?paths, group, "synchronizing cluster");
        let lock = group_lock(group);
        let _guard = lock.lock().unwrap();

        let mut hint: Vec<&str> = vec!["-G", group, "-h", "-r"];
        let path_strs: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        hint.extend(path_strs.iter().map(String::as_str));
        if !Self::run(&hint) {
            return;
        }
        if !Self::run(&["-G", group, "-c"]) {
            return;
        }
        Self::run(&["-G", group, "-u"]);
    }
}

/// Test replicator that records every path it was asked to synchronise.
#[derive(Default)]
pub struct RecordingReplicator {
    paths: Mutex<Vec<PathBuf>>,
}

impl RecordingReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// All paths replicated so far, in call order.
    pub fn recorded(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

impl Replicator for RecordingReplicator {
    fn replicate(&self, paths: &[PathBuf]) {
        self.paths.lock().unwrap().extend_from_slice(paths);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_is_noop() {
        let sync = Csync2::new(Some("   "));
        assert!(sync.group.is_none());
        // Must not attempt to launch csync2
        sync.replicate(&[PathBuf::from("/nonexistent")]);
    }

    #[test]
    fn recording_replicator_captures_order() {
        let recorder = RecordingReplicator::new();
        recorder.replicate(&[PathBuf::from("/a")]);
        recorder.replicate(&[PathBuf::from("/b"), PathBuf::from("/c")]);
        assert_eq!(
            recorder.recorded(),
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }
}
