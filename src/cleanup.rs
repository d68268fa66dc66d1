use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::runtime::Runtime;

/// RAII guard removing a partially written path unless the operation succeeded.
pub struct CleanupGuard {
    runtime: Arc<dyn Runtime>,
    paths: Vec<PathBuf>,
}

impl CleanupGuard {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            paths: Vec::new(),
        }
    }

    /// Register a path to remove if the guard is dropped without `success`.
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Mark the operation as successful, keeping every registered path.
    pub fn success(mut self) {
        self.paths.clear();
    }

    fn remove(&self, path: &Path) {
        if !self.runtime.exists(path) {
            return;
        }
        debug!("Cleaning up: {:?}", path);
        let result = if self.runtime.is_dir(path) {
            self.runtime.remove_dir_all(path)
        } else {
            self.runtime.remove_file(path)
        };
        if let Err(e) = result {
            warn!("Failed to clean up {}: {:#}", path.display(), e);
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in self.paths.iter().rev() {
            self.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_guard_removes_paths_on_drop() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.tar.gz");
        let sub_dir = dir.path().join("extracted");
        fs::write(&file_path, "test").unwrap();
        fs::create_dir(&sub_dir).unwrap();
        fs::write(sub_dir.join("file.txt"), "test").unwrap();

        {
            let mut guard = CleanupGuard::new(Arc::new(RealRuntime));
            guard.add(&file_path);
            guard.add(&sub_dir);
            assert_eq!(guard.paths().len(), 2);
        }

        assert!(!file_path.exists());
        assert!(!sub_dir.exists());
    }

    #[test]
    fn test_guard_success_keeps_paths() {
        let dir = tempdir().unwrap();
        let sub_dir = dir.path().join("extracted");
        fs::create_dir(&sub_dir).unwrap();

        let mut guard = CleanupGuard::new(Arc::new(RealRuntime));
        guard.add(&sub_dir);
        guard.success();

        assert!(sub_dir.exists());
    }

    #[test]
    fn test_guard_skips_missing_paths() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_exists()
            .with(eq(PathBuf::from("/cache/missing")))
            .returning(|_| false);
        runtime.expect_remove_dir_all().never();
        runtime.expect_remove_file().never();

        let mut guard = CleanupGuard::new(Arc::new(runtime));
        guard.add("/cache/missing");
    }

    #[test]
    fn test_guard_logs_failed_removal() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);
        runtime.expect_is_dir().returning(|_| false);
        runtime
            .expect_remove_file()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("permission denied")));

        let mut guard = CleanupGuard::new(Arc::new(runtime));
        guard.add("/cache/locked");
    }
}
