//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage a temporary CDN root with helper
//! writers, so tests never touch a real deployment.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Isolated test environment with a unique CDN root
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated CDN root directory
    pub cdn_root: PathBuf,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let cdn_root = temp_dir.path().join("cdn");
        Ok(Self {
            _temp_dir: temp_dir,
            cdn_root,
        })
    }

    /// Path of the resources tree inside the root
    pub fn resources_dir(&self) -> PathBuf {
        self.cdn_root.join("resources")
    }

    /// Path of the uploads area inside the root
    pub fn uploads_dir(&self) -> PathBuf {
        self.cdn_root.join("uploads")
    }

    /// Create a file with content at a path relative to the CDN root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.cdn_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a directory at a path relative to the CDN root
    pub fn create_dir(&self, relative_path: &str) -> std::io::Result<PathBuf> {
        let path = self.cdn_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// List the file names inside a directory, sorted
    pub fn list_names(&self, dir: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
