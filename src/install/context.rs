//! Resources gathered by one installation or check run.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use super::InstallationRecord;
use crate::lease::PathLease;

#[derive(Default)]
struct ContextState {
    library_packages: HashMap<String, InstallationRecord>,
    library_paths: BTreeSet<PathBuf>,
    leases: Vec<PathLease>,
    installation: Option<InstallationRecord>,
    closed: bool,
}

/// Owns the leases acquired during one run and the dependency installations
/// that make up its library search path.
///
/// Leases are released exactly once, by [`close`](Self::close) or on drop,
/// whichever comes first.
#[derive(Default)]
pub struct InstallationContext {
    state: Mutex<ContextState>,
}

impl InstallationContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps `lease` until the context closes. A closed context releases it
    /// immediately.
    pub fn add_lease(&self, lease: PathLease) {
        let mut state = self.lock();
        if state.closed {
            debug!("Context already closed, releasing {}", lease.path().display());
            return;
        }
        state.leases.push(lease);
    }

    /// Registers an installed dependency and its library directory.
    pub fn add_library_package(&self, record: InstallationRecord) {
        let mut state = self.lock();
        if let Some(path) = &record.library_path {
            state.library_paths.insert(path.clone());
        }
        state
            .library_packages
            .insert(record.package_name.clone(), record);
    }

    pub fn library_package(&self, name: &str) -> Option<InstallationRecord> {
        self.lock().library_packages.get(name).cloned()
    }

    /// Dependency installations, ordered by package name.
    pub fn library_packages(&self) -> Vec<InstallationRecord> {
        let state = self.lock();
        let mut records: Vec<_> = state.library_packages.values().cloned().collect();
        records.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        records
    }

    pub fn library_paths(&self) -> BTreeSet<PathBuf> {
        self.lock().library_paths.clone()
    }

    pub fn set_installation(&self, record: InstallationRecord) {
        self.lock().installation = Some(record);
    }

    pub fn installation(&self) -> Option<InstallationRecord> {
        self.lock().installation.clone()
    }

    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Releases every lease held by the context.
    pub fn close(&self) {
        let leases = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.leases)
        };
        if !leases.is_empty() {
            debug!("Releasing {} lease(s)", leases.len());
        }
        drop(leases);
    }
}

impl Drop for InstallationContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseCounter;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_close_releases_leases_once() {
        let counter = Arc::new(LeaseCounter::default());
        let context = InstallationContext::new();
        context.add_lease(PathLease::tracked("/cache/B_1.0/B", Arc::clone(&counter)));
        context.add_lease(PathLease::tracked("/cache/B_1.0/B", Arc::clone(&counter)));
        assert_eq!(counter.holders(), 2);

        context.close();
        assert_eq!(counter.holders(), 0);
        assert_eq!(context.lease_count(), 0);

        // Leases added after closing are not kept
        context.add_lease(PathLease::tracked("/cache/B_1.0/B", Arc::clone(&counter)));
        assert_eq!(counter.holders(), 0);

        drop(context);
        assert_eq!(counter.holders(), 0);
    }

    #[test]
    fn test_drop_releases_leases() {
        let counter = Arc::new(LeaseCounter::default());
        {
            let context = InstallationContext::new();
            context.add_lease(PathLease::tracked("/lib/1", Arc::clone(&counter)));
            assert_eq!(counter.holders(), 1);
        }
        assert_eq!(counter.holders(), 0);
    }

    #[test]
    fn test_library_packages_register_paths() {
        let context = InstallationContext::new();
        let mut b = InstallationRecord::pending_for_test("B", "1.0");
        b.library_path = Some(PathBuf::from("/lib/2"));
        let mut a = InstallationRecord::pending_for_test("A", "2.0");
        a.library_path = Some(PathBuf::from("/lib/1"));

        context.add_library_package(b);
        context.add_library_package(a);

        let names: Vec<_> = context
            .library_packages()
            .into_iter()
            .map(|r| r.package_name)
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(context.library_paths().contains(Path::new("/lib/2")));
        assert_eq!(context.library_package("B").unwrap().package_name, "B");
        assert!(context.library_package("C").is_none());
    }
}
