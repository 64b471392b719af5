//! # mediagrid-config
//!
//! Configuration management for mediagrid peers.
//!
//! Loads configuration from:
//! 1. A TOML file (`/etc/mediagrid/config.toml` by default)
//! 2. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mediagrid/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration of one mediagrid peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the CDN data.
    pub root: PathBuf,
    /// csync2 group to synchronise after each change; empty disables
    /// replication.
    pub csync2_group: String,
    /// Whether this peer introduces entirely new resources.  Only uploader
    /// peers create the `uploads/` area.
    pub uploader: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/mediagrid"),
            csync2_group: String::new(),
            uploader: false,
        }
    }
}

impl Config {
    /// Loads config from the default location, falling back to defaults
    /// when the file does not exist.  Environment variables override.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Loads config from a specific file, applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            debug!("loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `MEDIAGRID_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("MEDIAGRID_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Ok(group) = std::env::var("MEDIAGRID_CSYNC2_GROUP") {
            self.csync2_group = group;
        }
        if let Ok(uploader) = std::env::var("MEDIAGRID_UPLOADER") {
            self.uploader = matches!(uploader.as_str(), "1" | "true" | "yes");
        }
    }

    /// The csync2 group as an option: `None` when empty after trimming.
    pub fn csync2_group(&self) -> Option<&str> {
        let trimmed = self.csync2_group.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.root, PathBuf::from("/var/lib/mediagrid"));
        assert!(config.csync2_group().is_none());
        assert!(!config.uploader);
    }

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
            root = "/srv/cdn"
            csync2_group = "cdn"
            uploader = true
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/cdn"));
        assert_eq!(config.csync2_group(), Some("cdn"));
        assert!(config.uploader);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: Config = toml::from_str(r#"uploader = true"#).unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/mediagrid"));
        assert!(config.uploader);
    }

    #[test]
    fn blank_group_is_none() {
        let config: Config = toml::from_str(r#"csync2_group = "   ""#).unwrap();
        assert!(config.csync2_group().is_none());
    }
}
