//! Persisted installation records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::messages::{InstallationOutcome, InstallerReference, PackageResultMessage};
use crate::progress::ProgressMessage;
use crate::runtime::Runtime;
use crate::version::{Version, VersionNumber};

/// Outcome of installing one package version with one installer capability
/// on top of one exact set of dependency installations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub id: u64,
    pub package_name: String,
    pub package_version: Option<Version>,
    pub source_type: String,
    pub source_location: Option<String>,
    pub source_version: Version,
    pub installer: InstallerReference,
    /// Ids of the records this installation was built against.
    pub dependencies: BTreeSet<u64>,
    /// `None` while the installation has not finished.
    pub failed: Option<bool>,
    pub library_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub progress: Vec<ProgressMessage>,
}

impl InstallationRecord {
    pub fn is_failed(&self) -> bool {
        self.failed == Some(true)
    }

    #[cfg(test)]
    pub(crate) fn pending_for_test(name: &str, version: &str) -> Self {
        Self {
            id: 0,
            package_name: name.to_string(),
            package_version: Some(Version::parse(version).unwrap()),
            source_type: "CRAN".to_string(),
            source_location: None,
            source_version: Version::parse(version).unwrap(),
            installer: InstallerReference::new(Version::parse("3.0.2").unwrap()),
            dependencies: BTreeSet::new(),
            failed: None,
            library_path: None,
            log_path: None,
            progress: Vec::new(),
        }
    }
}

impl From<&InstallationRecord> for PackageResultMessage {
    fn from(record: &InstallationRecord) -> Self {
        Self {
            name: record.package_name.clone(),
            package_version: record.package_version.clone(),
            source_type: record.source_type.clone(),
            source_location: record.source_location.clone(),
            source_version: Some(record.source_version.clone()),
            installation: record.failed.map(|failed| InstallationOutcome { failed }),
            progress: record.progress.clone(),
        }
    }
}

/// Everything needed to create a record.
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub package_name: String,
    pub package_version: Option<Version>,
    pub source_type: String,
    pub source_location: Option<String>,
    pub source_version: Version,
    pub installer: InstallerReference,
    pub dependencies: BTreeSet<u64>,
}

/// Lookup criteria of a record.
#[derive(Debug, Clone)]
pub struct InstallationQuery<'a> {
    pub package_name: &'a str,
    pub source_version: &'a Version,
    /// Installer versions whose records are compatible, `[min, max)`.
    pub installer_range: (VersionNumber, VersionNumber),
    pub flavor: Option<&'a str>,
    pub architecture: Option<&'a str>,
    pub dependencies: &'a BTreeSet<u64>,
}

impl InstallationQuery<'_> {
    pub fn matches(&self, record: &InstallationRecord) -> bool {
        let installer_version = record.installer.version.number();
        record.package_name == self.package_name
            && record.source_version == *self.source_version
            && installer_version >= self.installer_range.0
            && installer_version < self.installer_range.1
            && record.installer.flavor.as_deref() == self.flavor
            && record.installer.architecture.as_deref() == self.architecture
            && record.dependencies == *self.dependencies
    }
}

pub trait InstallationStore: Send + Sync {
    /// Most recent record matching the query.
    fn find(&self, query: &InstallationQuery<'_>) -> Result<Option<InstallationRecord>>;
    fn get(&self, id: u64) -> Result<Option<InstallationRecord>>;
    fn insert(&self, new: NewInstallation) -> Result<InstallationRecord>;
    /// Returns the record matching `query`, creating a pending one from `new`
    /// if there is none. Lookup and creation happen atomically.
    fn find_or_insert(
        &self,
        query: &InstallationQuery<'_>,
        new: NewInstallation,
    ) -> Result<InstallationRecord>;
    fn update(&self, record: &InstallationRecord) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    records: BTreeMap<u64, InstallationRecord>,
}

/// Records kept in memory, optionally mirrored to a JSON file.
pub struct MemoryInstallationStore {
    state: Mutex<StoreState>,
    persistence: Option<(Arc<dyn Runtime>, PathBuf)>,
}

impl Default for MemoryInstallationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInstallationStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_id: 1,
                records: BTreeMap::new(),
            }),
            persistence: None,
        }
    }

    /// Loads the records saved at `path` (if any) and saves every change back.
    pub fn open(runtime: Arc<dyn Runtime>, path: PathBuf) -> Result<Self> {
        let state = if runtime.exists(&path) {
            let content = runtime.read_to_string(&path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse installation records {}", path.display()))?
        } else {
            StoreState {
                next_id: 1,
                records: BTreeMap::new(),
            }
        };
        debug!("Loaded {} installation record(s)", state.records.len());

        Ok(Self {
            state: Mutex::new(state),
            persistence: Some((runtime, path)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let Some((runtime, path)) = &self.persistence else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            runtime.create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        runtime
            .write_atomic(path, &json)
            .with_context(|| format!("Failed to save installation records {}", path.display()))
    }
}

impl InstallationStore for MemoryInstallationStore {
    fn find(&self, query: &InstallationQuery<'_>) -> Result<Option<InstallationRecord>> {
        let state = self.lock();
        Ok(state
            .records
            .values()
            .rev()
            .find(|record| query.matches(record))
            .cloned())
    }

    fn get(&self, id: u64) -> Result<Option<InstallationRecord>> {
        Ok(self.lock().records.get(&id).cloned())
    }

    fn insert(&self, new: NewInstallation) -> Result<InstallationRecord> {
        let mut state = self.lock();
        self.insert_locked(&mut state, new)
    }

    fn find_or_insert(
        &self,
        query: &InstallationQuery<'_>,
        new: NewInstallation,
    ) -> Result<InstallationRecord> {
        let mut state = self.lock();
        if let Some(record) = state.records.values().rev().find(|r| query.matches(r)) {
            return Ok(record.clone());
        }
        self.insert_locked(&mut state, new)
    }

    fn update(&self, record: &InstallationRecord) -> Result<()> {
        let mut state = self.lock();
        if !state.records.contains_key(&record.id) {
            anyhow::bail!("Unknown installation record {}", record.id);
        }
        state.records.insert(record.id, record.clone());
        self.persist(&state)
    }
}

impl MemoryInstallationStore {
    fn insert_locked(&self, state: &mut StoreState, new: NewInstallation) -> Result<InstallationRecord> {
        let id = state.next_id;
        state.next_id += 1;

        let record = InstallationRecord {
            id,
            package_name: new.package_name,
            package_version: new.package_version,
            source_type: new.source_type,
            source_location: new.source_location,
            source_version: new.source_version,
            installer: new.installer,
            dependencies: new.dependencies,
            failed: None,
            library_path: None,
            log_path: None,
            progress: Vec::new(),
        };
        state.records.insert(id, record.clone());
        self.persist(state)?;
        debug!("Created installation record {} for {}", id, record.package_name);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use tempfile::tempdir;

    fn new_installation(name: &str, installer: &str, deps: &[u64]) -> NewInstallation {
        NewInstallation {
            package_name: name.to_string(),
            package_version: Some(Version::parse("1.0").unwrap()),
            source_type: "CRAN".to_string(),
            source_location: None,
            source_version: Version::parse("1.0").unwrap(),
            installer: InstallerReference::new(Version::parse(installer).unwrap()),
            dependencies: deps.iter().copied().collect(),
        }
    }

    fn range(min: &str, max: &str) -> (VersionNumber, VersionNumber) {
        (
            VersionNumber::encode(min).unwrap(),
            VersionNumber::encode(max).unwrap(),
        )
    }

    #[test]
    fn test_find_matches_installer_range_and_dependencies() {
        let store = MemoryInstallationStore::new();
        let b = store.insert(new_installation("B", "3.0.2", &[])).unwrap();
        let a = store.insert(new_installation("A", "3.0.2", &[b.id])).unwrap();

        let version = Version::parse("1.0").unwrap();
        let deps: BTreeSet<u64> = [b.id].into();
        let mut query = InstallationQuery {
            package_name: "A",
            source_version: &version,
            installer_range: range("3.0.0", "4.0.0"),
            flavor: None,
            architecture: None,
            dependencies: &deps,
        };
        assert_eq!(store.find(&query).unwrap().unwrap().id, a.id);

        let no_deps = BTreeSet::new();
        query.dependencies = &no_deps;
        assert!(store.find(&query).unwrap().is_none());

        query.dependencies = &deps;
        query.installer_range = range("3.1.0", "4.0.0");
        assert!(store.find(&query).unwrap().is_none());

        query.installer_range = range("3.0.0", "4.0.0");
        query.flavor = Some("devel");
        assert!(store.find(&query).unwrap().is_none());
    }

    #[test]
    fn test_find_or_insert_reuses_matching_record() {
        let store = MemoryInstallationStore::new();
        let version = Version::parse("1.0").unwrap();
        let deps = BTreeSet::new();
        let query = InstallationQuery {
            package_name: "A",
            source_version: &version,
            installer_range: range("3.0.0", "4.0.0"),
            flavor: None,
            architecture: None,
            dependencies: &deps,
        };

        let first = store
            .find_or_insert(&query, new_installation("A", "3.0.2", &[]))
            .unwrap();
        let second = store
            .find_or_insert(&query, new_installation("A", "3.0.2", &[]))
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_update_and_get() {
        let store = MemoryInstallationStore::new();
        let mut record = store.insert(new_installation("A", "3.0.2", &[])).unwrap();
        assert_eq!(record.failed, None);

        record.failed = Some(true);
        record.library_path = Some(PathBuf::from("/lib/1"));
        store.update(&record).unwrap();

        let stored = store.get(record.id).unwrap().unwrap();
        assert!(stored.is_failed());
        assert_eq!(stored.library_path, Some(PathBuf::from("/lib/1")));
    }

    #[test]
    fn test_update_unknown_record_fails() {
        let store = MemoryInstallationStore::new();
        let mut record = InstallationRecord::pending_for_test("A", "1.0");
        record.id = 42;
        assert!(store.update(&record).is_err());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/installations.json");
        let runtime: Arc<dyn Runtime> = Arc::new(RealRuntime);

        let first_id = {
            let store = MemoryInstallationStore::open(Arc::clone(&runtime), path.clone()).unwrap();
            store.insert(new_installation("A", "3.0.2", &[])).unwrap().id
        };

        let store = MemoryInstallationStore::open(runtime, path).unwrap();
        assert!(store.get(first_id).unwrap().is_some());
        let second = store.insert(new_installation("B", "3.0.2", &[])).unwrap();
        assert_eq!(second.id, first_id + 1);
    }

    #[test]
    fn test_open_reports_corrupt_file() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);
        runtime
            .expect_read_to_string()
            .returning(|_| Ok("not json".to_string()));

        let result = MemoryInstallationStore::open(Arc::new(runtime), PathBuf::from("/x.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_record_to_result_message() {
        let mut record = InstallationRecord::pending_for_test("B", "1.0");
        record.failed = Some(false);

        let message = PackageResultMessage::from(&record);
        assert_eq!(message.name, "B");
        assert_eq!(message.installation, Some(InstallationOutcome { failed: false }));
        assert_eq!(message.source_version, Some(Version::parse("1.0").unwrap()));
    }
}
