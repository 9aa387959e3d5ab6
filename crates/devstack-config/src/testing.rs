//! Isolated filesystem fixtures for symlink-manager tests.
//!
//! Every test gets its own scratch device filesystem and claim index
//! root inside a tempdir, so tests never touch `/dev` or `/run` and can
//! run concurrently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Scratch device filesystem plus claim index root, unique per test.
pub struct TestEnvironment {
    /// Temporary directory (removed on drop).
    _temp_dir: TempDir,
    /// Stand-in for `/dev`.
    pub dev_root: PathBuf,
    /// Stand-in for `/run/udev/links`.
    pub links_root: PathBuf,
    /// Unique test id.
    pub test_id: u32,
}

impl TestEnvironment {
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let dev_root = root.join("dev");
        let links_root = root.join("run/links");
        std::fs::create_dir_all(&dev_root)?;
        std::fs::create_dir_all(&links_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            dev_root,
            links_root,
            test_id,
        })
    }

    /// Config pointing the core at this environment's scratch roots.
    pub fn config(&self) -> Config {
        Config::with_roots(&self.dev_root, &self.links_root)
    }

    /// Fabricate a device node under the scratch device root.
    ///
    /// The node is a regular file: creating real block/char inodes needs
    /// privileges the test run may not have, and the symlink paths under
    /// test only care that the target exists.
    pub fn create_device_node(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.dev_root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, b"")?;
        Ok(path)
    }

    /// Absolute stable-name path under the scratch device root.
    pub fn devlink(&self, relative: &str) -> PathBuf {
        self.dev_root.join(relative)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("failed to create test environment")
    }
}
