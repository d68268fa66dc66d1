//! Scoped access to filesystem paths.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Counts the leases currently held on one path.
#[derive(Debug, Default)]
pub struct LeaseCounter(AtomicUsize);

impl LeaseCounter {
    pub fn holders(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A path that stays in use until the lease is dropped.
///
/// Every lease keeps the holder count of its path up to date, so an owner
/// can tell whether a cached path is still in use.
pub struct PathLease {
    path: PathBuf,
    counter: Arc<LeaseCounter>,
}

impl PathLease {
    pub fn tracked(path: impl Into<PathBuf>, counter: Arc<LeaseCounter>) -> Self {
        counter.0.fetch_add(1, Ordering::SeqCst);
        Self {
            path: path.into(),
            counter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ends the lease. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for PathLease {
    fn drop(&mut self) {
        self.counter.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for PathLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLease")
            .field("path", &self.path)
            .field("holders", &self.counter.holders())
            .finish()
    }
}

/// Hands out leases on many paths.
///
/// Only weak references to the counters are kept, so a path drops out of
/// the table once its last lease is gone.
#[derive(Default)]
pub struct LeaseTable {
    counters: Mutex<HashMap<PathBuf, Weak<LeaseCounter>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self, path: impl Into<PathBuf>) -> PathLease {
        let path = path.into();
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.retain(|_, counter| counter.strong_count() > 0);
        let counter = match counters.get(&path).and_then(Weak::upgrade) {
            Some(counter) => counter,
            None => {
                let counter = Arc::new(LeaseCounter::default());
                counters.insert(path.clone(), Arc::downgrade(&counter));
                counter
            }
        };
        PathLease::tracked(path, counter)
    }

    /// Number of leases currently held on `path`.
    pub fn holders(&self, path: &Path) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .and_then(Weak::upgrade)
            .map_or(0, |counter| counter.holders())
    }

    /// Number of paths with at least one lease.
    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|counter| counter.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_leases_count_holders() {
        let counter = Arc::new(LeaseCounter::default());

        let first = PathLease::tracked("/cache/zoo_1.0/zoo", Arc::clone(&counter));
        let second = PathLease::tracked("/cache/zoo_1.0/zoo", Arc::clone(&counter));
        assert_eq!(counter.holders(), 2);
        assert_eq!(first.path(), Path::new("/cache/zoo_1.0/zoo"));

        first.release();
        assert_eq!(counter.holders(), 1);
        drop(second);
        assert_eq!(counter.holders(), 0);
    }

    #[test]
    fn test_table_forgets_released_paths() {
        // --- Setup ---
        let table = LeaseTable::new();
        let zoo = table.lease("/lib/1");
        let zoo_again = table.lease("/lib/1");
        let coda = table.lease("/lib/2");

        // --- Verify ---
        assert_eq!(table.holders(Path::new("/lib/1")), 2);
        assert_eq!(table.len(), 2);

        drop(zoo);
        drop(zoo_again);
        assert_eq!(table.holders(Path::new("/lib/1")), 0);
        assert_eq!(table.len(), 1);

        // Released entries are pruned on the next lease
        let other = table.lease("/lib/3");
        assert_eq!(table.counters.lock().unwrap().len(), 2);
        drop(coda);
        assert!(format!("{:?}", other).contains("holders: 1"));
    }
}
