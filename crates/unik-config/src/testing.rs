//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated host tree that manifests are built from
//! - A klib directory with dummy kernel libraries
//! - Output paths for produced images
//!
//! # Usage
//!
//! ```ignore
//! use unik_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let prog = env.create_file("bin/app", b"\x7fELF").unwrap();
//!     let image = env.image_path("app.img");
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Host tree that files are added from
    pub host_root: PathBuf,
    /// Directory holding kernel libraries
    pub klib_dir: PathBuf,
    /// Directory where images are written
    pub output_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let host_root = root.join("host");
        let klib_dir = root.join("klibs");
        let output_dir = root.join("out");

        std::fs::create_dir_all(&host_root)?;
        std::fs::create_dir_all(&klib_dir)?;
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            host_root,
            klib_dir,
            output_dir,
            test_id,
        })
    }

    /// Path for an image file inside the output directory
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}-{}", self.test_id, name))
    }

    /// Create a test file with content under the host tree
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.host_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory under the host tree
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.host_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Create a symlink under the host tree pointing at `target`
    #[cfg(unix)]
    pub fn create_symlink(&self, relative_path: &str, target: &str) -> anyhow::Result<PathBuf> {
        let path = self.host_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &path)?;
        Ok(path)
    }

    /// Drop a dummy kernel library into the klib directory
    pub fn create_klib(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.klib_dir.join(name);
        std::fs::write(&path, format!("klib {}", name))?;
        Ok(path)
    }

    /// Root of the temporary area
    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
