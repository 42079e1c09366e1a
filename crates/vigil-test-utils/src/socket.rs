//! Throwaway socket paths.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A socket path inside a private temp directory.
///
/// The directory is deleted when this value is dropped, guaranteeing
/// cleanup even on panic. Paths stay well inside the `sun_path` limit.
pub struct TestSocket {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestSocket {
    pub fn new() -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("vigil")
            .tempdir()
            .expect("failed to create temp dir");
        let path = temp_dir.path().join("helper.sock");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave a regular file where the socket goes, as a crashed helper would.
    pub fn plant_stale_file(&self) {
        std::fs::write(&self.path, b"stale").expect("failed to plant stale socket file");
    }
}

impl Default for TestSocket {
    fn default() -> Self {
        Self::new()
    }
}
