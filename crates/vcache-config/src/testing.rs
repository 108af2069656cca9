//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated socket paths
//! - Local directories where a client saves evicted and read files
//! - A server config pointing at all of the above
//!
//! # Usage
//!
//! ```ignore
//! use vcache_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.server_config();
//!     // start a server on config.server.socket_path; nothing is auto-started
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Where a client stores files evicted by the server
    pub evicted_dir: PathBuf,
    /// Where a client stores files it read
    pub read_dir: PathBuf,
    /// Scratch directory for local input files
    pub work_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let evicted_dir = root.join("evicted");
        let read_dir = root.join("read");
        let work_dir = root.join("work");

        std::fs::create_dir_all(&evicted_dir)?;
        std::fs::create_dir_all(&read_dir)?;
        std::fs::create_dir_all(&work_dir)?;

        // Unique socket path
        let socket_path = root.join(format!("vcache-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            socket_path,
            evicted_dir,
            read_dir,
            work_dir,
            test_id,
        })
    }

    /// Create a local file with content under `work_dir`
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Check if socket exists (server may be running)
    pub fn is_socket_present(&self) -> bool {
        self.socket_path.exists()
    }

    /// Default config bound to this environment's socket
    pub fn server_config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.server.socket_path = self.socket_path.clone();
        cfg
    }

    /// Config with a small store, handy for eviction tests
    pub fn server_config_with_capacity(&self, max_capacity_mb: u64, slots: usize) -> Config {
        let mut cfg = self.server_config();
        cfg.store.max_capacity_mb = max_capacity_mb;
        cfg.store.max_capacity_slots = slots;
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.evicted_dir.exists());
        assert!(env.read_dir.exists());
        assert!(env.work_dir.exists());
        assert!(!env.is_socket_present());
    }

    #[test]
    fn test_environment_has_unique_socket() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.socket_path, env2.socket_path);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("dir/a.txt", b"hello").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_server_config_uses_test_socket() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.server_config_with_capacity(1, 2);
        assert_eq!(cfg.server.socket_path, env.socket_path);
        assert_eq!(cfg.store.max_capacity_slots, 2);
    }
}
