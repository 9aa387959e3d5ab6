//! # devstack-config
//!
//! Configuration for the devstack symlink manager.
//!
//! The core only needs two paths: the device filesystem root and the
//! scratch directory holding the claim index. Both default to the
//! conventional locations and can be overridden from a TOML file or
//! programmatically (tests point them into a tempdir).

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Device filesystem root used when nothing else is configured.
pub const DEFAULT_DEV_ROOT: &str = "/dev";
/// Claim index root on scratch storage.
pub const DEFAULT_LINKS_ROOT: &str = "/run/udev/links";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Paths the symlink manager operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the device filesystem; every stable name must lie below it.
    pub dev_root: PathBuf,
    /// Root of the claim index on ephemeral scratch storage.
    pub links_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from(DEFAULT_DEV_ROOT),
            links_root: PathBuf::from(DEFAULT_LINKS_ROOT),
        }
    }
}

impl Config {
    /// Build a config with explicit roots.
    pub fn with_roots(dev_root: impl Into<PathBuf>, links_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
            links_root: links_root.into(),
        }
    }

    /// Load a config from a TOML file. Missing keys fall back to defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.dev_root, PathBuf::from("/dev"));
        assert_eq!(cfg.links_root, PathBuf::from("/run/udev/links"));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: Config = toml::from_str(r#"links_root = "/tmp/links""#).unwrap();
        assert_eq!(cfg.dev_root, PathBuf::from("/dev"));
        assert_eq!(cfg.links_root, PathBuf::from("/tmp/links"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devstack.toml");
        std::fs::write(
            &path,
            r#"
dev_root = "/mnt/dev"
links_root = "/mnt/run/links"
"#,
        )
        .unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.dev_root, PathBuf::from("/mnt/dev"));
        assert_eq!(cfg.links_root, PathBuf::from("/mnt/run/links"));
    }
}
