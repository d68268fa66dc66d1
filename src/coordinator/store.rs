//! Coordinator-side history of contexts, package sources and results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::messages::{CheckOutcome, InstallationOutcome, PackageResultMessage};
use crate::progress::ProgressMessage;
use crate::runtime::Runtime;
use crate::version::Version;

/// A named environment whose revision advances every time its dependency
/// snapshot changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageContext {
    pub id: u64,
    pub name: String,
    pub revision: u64,
}

/// All results of one package within one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSource {
    pub id: u64,
    pub context_id: u64,
    pub package_name: String,
    pub source_type: String,
    pub source_location: Option<String>,
    /// Highest revision any result of this source was recorded at.
    pub max_revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultKind {
    Installation,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub id: u64,
    pub source_id: u64,
    pub kind: ResultKind,
    pub revision: u64,
    pub package_version: Option<Version>,
    pub source_type: String,
    pub source_location: Option<String>,
    pub source_version: Option<Version>,
    pub installation: Option<InstallationOutcome>,
    pub check: Option<CheckOutcome>,
    #[serde(default)]
    pub progress: Vec<ProgressMessage>,
    /// Ids of the results this one was built against.
    #[serde(default)]
    pub dependencies: BTreeSet<u64>,
}

impl PackageResult {
    /// An unsaved result for a reported package.
    pub fn reported(
        source: &PackageSource,
        kind: ResultKind,
        revision: u64,
        message: &PackageResultMessage,
    ) -> Self {
        Self {
            id: 0,
            source_id: source.id,
            kind,
            revision,
            package_version: message.package_version.clone(),
            source_type: message.source_type.clone(),
            source_location: message.source_location.clone(),
            source_version: message.source_version.clone(),
            installation: message.installation,
            check: None,
            progress: message.progress.clone(),
            dependencies: BTreeSet::new(),
        }
    }
}

/// A failure reported for a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: u64,
    pub context_id: u64,
    pub revision: u64,
    pub package: String,
    pub failed_installation: Option<String>,
    pub error: String,
}

pub trait ResultStore: Send + Sync {
    fn create_context(&self, name: &str) -> Result<PackageContext>;
    fn context(&self, id: u64) -> Result<Option<PackageContext>>;
    fn contexts(&self) -> Result<Vec<PackageContext>>;
    fn update_context(&self, context: &PackageContext) -> Result<()>;

    fn find_source(&self, context_id: u64, package_name: &str) -> Result<Option<PackageSource>>;
    /// The source of `message` within the context, created if needed. The
    /// recorded source type and location follow the message.
    fn source_for(&self, context_id: u64, message: &PackageResultMessage) -> Result<PackageSource>;
    fn update_source(&self, source: &PackageSource) -> Result<()>;
    fn source(&self, id: u64) -> Result<Option<PackageSource>>;
    fn sources(&self, context_id: u64) -> Result<Vec<PackageSource>>;

    fn insert_result(&self, result: PackageResult) -> Result<PackageResult>;
    fn update_result(&self, result: &PackageResult) -> Result<()>;
    fn result(&self, id: u64) -> Result<Option<PackageResult>>;
    /// Results of a source, newest first.
    fn results(&self, source_id: u64) -> Result<Vec<PackageResult>>;

    fn add_diagnostic(&self, diagnostic: Diagnostic) -> Result<Diagnostic>;
    fn diagnostics(&self, context_id: u64) -> Result<Vec<Diagnostic>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultState {
    next_id: u64,
    contexts: BTreeMap<u64, PackageContext>,
    sources: BTreeMap<u64, PackageSource>,
    results: BTreeMap<u64, PackageResult>,
    diagnostics: BTreeMap<u64, Diagnostic>,
}

impl Default for ResultState {
    fn default() -> Self {
        Self {
            next_id: 1,
            contexts: BTreeMap::new(),
            sources: BTreeMap::new(),
            results: BTreeMap::new(),
            diagnostics: BTreeMap::new(),
        }
    }
}

impl ResultState {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// History kept in memory, optionally mirrored to a JSON file.
#[derive(Default)]
pub struct MemoryResultStore {
    state: Mutex<ResultState>,
    persistence: Option<(Arc<dyn Runtime>, PathBuf)>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the history saved at `path` (if any) and saves every change back.
    pub fn open(runtime: Arc<dyn Runtime>, path: PathBuf) -> Result<Self> {
        let state = if runtime.exists(&path) {
            let content = runtime.read_to_string(&path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse result history {}", path.display()))?
        } else {
            ResultState::default()
        };
        debug!(
            "Loaded {} context(s), {} result(s)",
            state.contexts.len(),
            state.results.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            persistence: Some((runtime, path)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ResultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &ResultState) -> Result<()> {
        let Some((runtime, path)) = &self.persistence else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            runtime.create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        runtime
            .write_atomic(path, &json)
            .with_context(|| format!("Failed to save result history {}", path.display()))
    }
}

impl ResultStore for MemoryResultStore {
    fn create_context(&self, name: &str) -> Result<PackageContext> {
        let mut state = self.lock();
        if state.contexts.values().any(|c| c.name == name) {
            bail!("Context '{}' already exists", name);
        }
        let context = PackageContext {
            id: state.allocate_id(),
            name: name.to_string(),
            revision: 0,
        };
        state.contexts.insert(context.id, context.clone());
        self.persist(&state)?;
        Ok(context)
    }

    fn context(&self, id: u64) -> Result<Option<PackageContext>> {
        Ok(self.lock().contexts.get(&id).cloned())
    }

    fn contexts(&self) -> Result<Vec<PackageContext>> {
        Ok(self.lock().contexts.values().cloned().collect())
    }

    fn update_context(&self, context: &PackageContext) -> Result<()> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&context.id) {
            bail!("Unknown context {}", context.id);
        }
        state.contexts.insert(context.id, context.clone());
        self.persist(&state)
    }

    fn find_source(&self, context_id: u64, package_name: &str) -> Result<Option<PackageSource>> {
        Ok(self
            .lock()
            .sources
            .values()
            .find(|s| s.context_id == context_id && s.package_name == package_name)
            .cloned())
    }

    fn source_for(&self, context_id: u64, message: &PackageResultMessage) -> Result<PackageSource> {
        let mut state = self.lock();
        let existing = state
            .sources
            .values_mut()
            .find(|s| s.context_id == context_id && s.package_name == message.name);
        let source = match existing {
            Some(source) => {
                source.source_type = message.source_type.clone();
                source.source_location = message.source_location.clone();
                source.clone()
            }
            None => {
                let source = PackageSource {
                    id: state.allocate_id(),
                    context_id,
                    package_name: message.name.clone(),
                    source_type: message.source_type.clone(),
                    source_location: message.source_location.clone(),
                    max_revision: 0,
                };
                state.sources.insert(source.id, source.clone());
                source
            }
        };
        self.persist(&state)?;
        Ok(source)
    }

    fn update_source(&self, source: &PackageSource) -> Result<()> {
        let mut state = self.lock();
        if !state.sources.contains_key(&source.id) {
            bail!("Unknown package source {}", source.id);
        }
        state.sources.insert(source.id, source.clone());
        self.persist(&state)
    }

    fn source(&self, id: u64) -> Result<Option<PackageSource>> {
        Ok(self.lock().sources.get(&id).cloned())
    }

    fn sources(&self, context_id: u64) -> Result<Vec<PackageSource>> {
        Ok(self
            .lock()
            .sources
            .values()
            .filter(|s| s.context_id == context_id)
            .cloned()
            .collect())
    }

    fn insert_result(&self, mut result: PackageResult) -> Result<PackageResult> {
        let mut state = self.lock();
        result.id = state.allocate_id();
        state.results.insert(result.id, result.clone());
        self.persist(&state)?;
        Ok(result)
    }

    fn update_result(&self, result: &PackageResult) -> Result<()> {
        let mut state = self.lock();
        if !state.results.contains_key(&result.id) {
            bail!("Unknown package result {}", result.id);
        }
        state.results.insert(result.id, result.clone());
        self.persist(&state)
    }

    fn result(&self, id: u64) -> Result<Option<PackageResult>> {
        Ok(self.lock().results.get(&id).cloned())
    }

    fn results(&self, source_id: u64) -> Result<Vec<PackageResult>> {
        let state = self.lock();
        let mut results: Vec<_> = state
            .results
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.revision.cmp(&a.revision).then(b.id.cmp(&a.id)));
        Ok(results)
    }

    fn add_diagnostic(&self, mut diagnostic: Diagnostic) -> Result<Diagnostic> {
        let mut state = self.lock();
        diagnostic.id = state.allocate_id();
        state.diagnostics.insert(diagnostic.id, diagnostic.clone());
        self.persist(&state)?;
        Ok(diagnostic)
    }

    fn diagnostics(&self, context_id: u64) -> Result<Vec<Diagnostic>> {
        Ok(self
            .lock()
            .diagnostics
            .values()
            .filter(|d| d.context_id == context_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use tempfile::tempdir;

    fn message(name: &str, source_type: &str) -> PackageResultMessage {
        PackageResultMessage {
            name: name.to_string(),
            package_version: None,
            source_type: source_type.to_string(),
            source_location: None,
            source_version: Some(Version::parse("1.0").unwrap()),
            installation: None,
            progress: Vec::new(),
        }
    }

    #[test]
    fn test_context_names_are_unique() {
        let store = MemoryResultStore::new();
        let context = store.create_context("release").unwrap();
        assert_eq!(context.revision, 0);
        assert!(store.create_context("release").is_err());
        assert_eq!(store.contexts().unwrap().len(), 1);
    }

    #[test]
    fn test_source_for_reuses_and_updates_source() {
        let store = MemoryResultStore::new();
        let context = store.create_context("release").unwrap();

        let first = store.source_for(context.id, &message("zoo", "CRAN")).unwrap();
        let mut svn = message("zoo", "SVN");
        svn.source_location = Some("https://svn.example/zoo".into());
        let second = store.source_for(context.id, &svn).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.source_type, "SVN");
        assert_eq!(
            store.find_source(context.id, "zoo").unwrap().unwrap().source_location,
            Some("https://svn.example/zoo".into())
        );
        assert!(store.find_source(context.id + 100, "zoo").unwrap().is_none());
    }

    #[test]
    fn test_results_newest_first() {
        let store = MemoryResultStore::new();
        let context = store.create_context("release").unwrap();
        let source = store.source_for(context.id, &message("zoo", "CRAN")).unwrap();

        for revision in [1, 3, 2] {
            let result = PackageResult::reported(&source, ResultKind::Installation, revision, &message("zoo", "CRAN"));
            store.insert_result(result).unwrap();
        }

        let revisions: Vec<_> = store
            .results(source.id)
            .unwrap()
            .iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(revisions, vec![3, 2, 1]);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");

        let store = MemoryResultStore::open(Arc::new(RealRuntime), path.clone()).unwrap();
        let context = store.create_context("release").unwrap();
        store
            .add_diagnostic(Diagnostic {
                id: 0,
                context_id: context.id,
                revision: 0,
                package: "zoo".into(),
                failed_installation: Some("lattice".into()),
                error: "installation of lattice 0.20 failed".into(),
            })
            .unwrap();
        drop(store);

        let reopened = MemoryResultStore::open(Arc::new(RealRuntime), path).unwrap();
        assert_eq!(reopened.context(context.id).unwrap().unwrap().name, "release");
        let diagnostics = reopened.diagnostics(context.id).unwrap();
        assert_eq!(diagnostics[0].failed_installation.as_deref(), Some("lattice"));

        // Ids keep counting after a reload
        let other = reopened.create_context("devel").unwrap();
        assert!(other.id > diagnostics[0].id);
    }
}
