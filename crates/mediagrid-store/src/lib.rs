//! # mediagrid-store
//!
//! Content-addressed media storage engine for a CDN.
//!
//! Immutable binary assets (JPEG, PNG, GIF) are persisted on a shared POSIX
//! filesystem; multiple machines cooperate as equal peers and an external
//! replicator (csync2 in multi-master mode) propagates changes between them.
//! The filesystem is the index: there is no database.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── resources/
//! │   ├── .lock                    # advisory lock, excluded from replication
//! │   └── ab12/                    # hash1, 4 lower-case hex chars
//! │       └── cd34/                # hash2, 4 lower-case hex chars
//! │           ├── 0123abcd/        # resource, 8 lower-case hex chars
//! │           │   ├── .lock
//! │           │   ├── original.jpg -> 778x584.jpg
//! │           │   ├── 778x584.jpg  # original version
//! │           │   └── 389x292.jpg  # derived version
//! │           └── 4567ef01.new/    # staging, never observed complete
//! └── uploads/                     # uploader peers only, not replicated
//! ```
//!
//! Resources are created by [`CdnData::find_or_add`] and never modified;
//! scaled versions are derived lazily by [`ImageVersion::scale`] and are
//! immutable once visible.

mod cdn;
mod content_type;
mod fs_util;
mod fsck;
mod lock;
mod naming;
mod replicate;
mod resource;
mod resources;
mod uploads;
mod version;

pub use cdn::CdnData;
pub use content_type::ContentType;
pub use fsck::{FsckIssue, FsckReport, Severity};
pub use lock::DirectoryLock;
pub use naming::ResourceId;
pub use replicate::{Csync2, RecordingReplicator, Replicator};
pub use resource::Resource;
pub use resources::{ResourceIter, Resources};
pub use uploads::{UploadFile, Uploads};
pub use version::{ImageVersion, Version};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The separator between a filename stem and its extension, both in the
/// filesystem and in URLs.
pub(crate) const EXTENSION_SEPARATOR: char = '.';

/// Extension for not-yet-committed files and directories.  Paths carrying
/// it are excluded from replication.
pub(crate) const NEW_EXTENSION: &str = "new";

/// Errors that can occur during CDN data operations
#[derive(Debug, Error)]
pub enum CdnError {
    /// A caller-supplied value was rejected: extension or MIME mismatch,
    /// upload handle already consumed or from another engine, scale-up
    /// refused, unsupported content type.
    #[error("invalid argument: {0}")]
    BadArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// An on-disk invariant does not hold outside of fsck.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The committed file's size no longer matches the upload.
    #[error("concurrent modification of {path}: expected {expected} bytes, found {actual}")]
    ConcurrentModification {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Start-up fsck found severe issues; the engine refuses to initialise.
    #[error("start-up fsck failed with {severe} severe issue(s), see log for details")]
    FsckSevere { severe: usize },
}

pub type Result<T> = std::result::Result<T, CdnError>;
