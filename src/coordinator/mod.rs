//! Coordinator side: merges worker results into the revision history and
//! plans further check tasks.

mod store;
mod tasks;

pub use store::{
    Diagnostic, MemoryResultStore, PackageContext, PackageResult, PackageSource, ResultKind,
    ResultStore,
};
pub use tasks::CheckTaskPlanner;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::messages::{CheckResultMessage, ExceptionResultMessage, PackageResultMessage, ResultMessage};

/// What a reconciliation did with a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The message named no known context.
    Dropped,
    /// The context moved to a new revision; `result_id` is the root's result.
    Advanced { revision: u64, result_id: u64 },
    /// An installation result of the root became its check result.
    Promoted { result_id: u64 },
    /// The root already had a check result for this dependency snapshot.
    Unchanged { result_id: u64 },
    /// An exception was stored as a diagnostic.
    Recorded { diagnostic_id: u64 },
}

/// How a recorded result compares to a reported package.
enum Comparison {
    Missing,
    Older,
    Equal(PackageResult),
}

pub struct RevisionReconciler {
    store: Arc<dyn ResultStore>,
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RevisionReconciler {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    fn context_lock(&self, context_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(context_id).or_default())
    }

    /// Merges one result message into the history of its context.
    ///
    /// Reconciliations of the same context run one at a time.
    #[tracing::instrument(skip_all, fields(package = %message.package().name))]
    pub async fn reconcile(&self, message: &ResultMessage) -> Result<ReconcileOutcome> {
        let Some(context_id) = message.context_ref() else {
            warn!("Dropping result for {} without context", message.package().name);
            return Ok(ReconcileOutcome::Dropped);
        };

        let lock = self.context_lock(context_id);
        let _guard = lock.lock().await;

        let Some(context) = self.store.context(context_id)? else {
            warn!(
                "Dropping result for {}: unknown context {}",
                message.package().name,
                context_id
            );
            return Ok(ReconcileOutcome::Dropped);
        };

        match message {
            ResultMessage::Check(result) => self.reconcile_check(context, result),
            ResultMessage::Exception(exception) => self.record_exception(&context, exception),
        }
    }

    fn reconcile_check(
        &self,
        mut context: PackageContext,
        message: &CheckResultMessage,
    ) -> Result<ReconcileOutcome> {
        let dependencies = dependency_snapshot(message);

        let mut matched = Vec::with_capacity(dependencies.len() + 1);
        let mut revisions = BTreeSet::new();
        let mut new_context = false;
        for entry in dependencies.iter().copied().chain([&message.package]) {
            match self.compare(&context, entry)? {
                Comparison::Equal(result) => {
                    revisions.insert(result.revision);
                    matched.push(result);
                }
                Comparison::Missing | Comparison::Older => {
                    debug!("{} differs from revision {}", entry.name, context.revision);
                    new_context = true;
                    break;
                }
            }
        }
        // Matching results recorded at different revisions cannot share edges
        if !new_context && revisions.len() > 1 {
            debug!(
                "{} matched results of revisions {:?}",
                message.package.name, revisions
            );
            new_context = true;
        }

        if new_context {
            return self.advance(&mut context, &dependencies, message);
        }

        let Some(mut root) = matched.pop() else {
            return Err(anyhow::anyhow!("No result matched {}", message.package.name).into());
        };
        if root.kind == ResultKind::Check {
            debug!("{} already checked at revision {}", message.package.name, root.revision);
            return Ok(ReconcileOutcome::Unchanged { result_id: root.id });
        }

        root.kind = ResultKind::Check;
        root.check = Some(message.check);
        root.progress = message.progress.clone();
        root.dependencies = matched.iter().map(|r| r.id).collect();
        self.store.update_result(&root)?;
        info!(
            "Promoted {} to a check result at revision {}",
            message.package.name, root.revision
        );
        Ok(ReconcileOutcome::Promoted { result_id: root.id })
    }

    /// Compares the latest recorded result of `entry` in the context.
    fn compare(&self, context: &PackageContext, entry: &PackageResultMessage) -> Result<Comparison> {
        let Some(source) = self.store.find_source(context.id, &entry.name)? else {
            return Ok(Comparison::Missing);
        };
        let Some(recorded) = self
            .store
            .results(source.id)?
            .into_iter()
            .find(|r| r.revision == source.max_revision)
        else {
            return Ok(Comparison::Missing);
        };

        if recorded.source_type != entry.source_type
            || recorded.source_location != entry.source_location
        {
            return Ok(Comparison::Older);
        }
        let (Some(recorded_version), Some(reported_version)) =
            (&recorded.source_version, &entry.source_version)
        else {
            return Ok(Comparison::Older);
        };

        match recorded_version.cmp(reported_version) {
            Ordering::Less => Ok(Comparison::Older),
            Ordering::Equal => Ok(Comparison::Equal(recorded)),
            Ordering::Greater => Err(Error::RevisionInconsistency {
                package: entry.name.clone(),
                recorded: recorded_version.clone(),
                reported: reported_version.clone(),
            }),
        }
    }

    fn advance(
        &self,
        context: &mut PackageContext,
        dependencies: &[&PackageResultMessage],
        message: &CheckResultMessage,
    ) -> Result<ReconcileOutcome> {
        context.revision += 1;
        let revision = context.revision;
        self.store.update_context(context)?;

        let mut edges = BTreeSet::new();
        for dependency in dependencies {
            let mut source = self.store.source_for(context.id, dependency)?;
            source.max_revision = revision;
            self.store.update_source(&source)?;
            let result = self.store.insert_result(PackageResult::reported(
                &source,
                ResultKind::Installation,
                revision,
                dependency,
            ))?;
            edges.insert(result.id);
        }

        let mut source = self.store.source_for(context.id, &message.package)?;
        source.max_revision = revision;
        self.store.update_source(&source)?;
        let mut root = PackageResult::reported(&source, ResultKind::Check, revision, &message.package);
        root.check = Some(message.check);
        root.progress = message.progress.clone();
        root.dependencies = edges;
        let root = self.store.insert_result(root)?;

        info!(
            "Context {} advanced to revision {} by {}",
            context.name, revision, message.package.name
        );
        Ok(ReconcileOutcome::Advanced {
            revision,
            result_id: root.id,
        })
    }

    fn record_exception(
        &self,
        context: &PackageContext,
        message: &ExceptionResultMessage,
    ) -> Result<ReconcileOutcome> {
        let diagnostic = self.store.add_diagnostic(Diagnostic {
            id: 0,
            context_id: context.id,
            revision: context.revision,
            package: message.package.name.clone(),
            failed_installation: message.failed_installation.as_ref().map(|p| p.name.clone()),
            error: message.error.clone(),
        })?;
        info!(
            "Recorded failure of {} in context {}: {}",
            message.package.name, context.name, message.error
        );
        Ok(ReconcileOutcome::Recorded {
            diagnostic_id: diagnostic.id,
        })
    }
}

/// Installation dependencies, each package once, sorted by name. Packages
/// needed only by the check are not part of the revision.
fn dependency_snapshot(message: &CheckResultMessage) -> Vec<&PackageResultMessage> {
    let mut by_name = BTreeMap::new();
    for dependency in &message.installation_dependencies {
        if dependency.name != message.package.name {
            by_name.entry(dependency.name.as_str()).or_insert(dependency);
        }
    }
    by_name.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CheckOutcome, InstallationOutcome, InstallerReference, PackageReference};
    use crate::version::Version;

    fn package(name: &str, version: &str) -> PackageResultMessage {
        PackageResultMessage {
            name: name.to_string(),
            package_version: Some(Version::parse(version).unwrap()),
            source_type: "CRAN".to_string(),
            source_location: None,
            source_version: Some(Version::parse(version).unwrap()),
            installation: Some(InstallationOutcome { failed: false }),
            progress: Vec::new(),
        }
    }

    fn check(context: u64, root: PackageResultMessage, deps: &[PackageResultMessage]) -> ResultMessage {
        check_with(context, root, deps, deps)
    }

    fn check_with(
        context: u64,
        root: PackageResultMessage,
        installation: &[PackageResultMessage],
        check: &[PackageResultMessage],
    ) -> ResultMessage {
        ResultMessage::Check(CheckResultMessage {
            context_ref: Some(context),
            package: root,
            installation_dependencies: installation.to_vec(),
            check_dependencies: check.to_vec(),
            installer: InstallerReference::new(Version::parse("3.0.2").unwrap()),
            check: CheckOutcome {
                notes: 1,
                ..Default::default()
            },
            progress: Vec::new(),
        })
    }

    fn reconciler() -> (RevisionReconciler, u64) {
        let store = Arc::new(MemoryResultStore::new());
        let context = store.create_context("release").unwrap();
        (RevisionReconciler::new(store), context.id)
    }

    fn result_count(reconciler: &RevisionReconciler, context: u64) -> usize {
        let store = reconciler.store();
        store
            .sources(context)
            .unwrap()
            .iter()
            .map(|s| store.results(s.id).unwrap().len())
            .sum()
    }

    #[tokio::test]
    async fn test_first_result_advances_revision() {
        // --- Setup ---
        let (reconciler, context) = reconciler();

        // --- Execute ---
        let outcome = reconciler
            .reconcile(&check(context, package("A", "2.1"), &[package("B", "1.0")]))
            .await
            .unwrap();

        // --- Verify ---
        let ReconcileOutcome::Advanced { revision, result_id } = outcome else {
            panic!("expected a new revision, got {outcome:?}");
        };
        assert_eq!(revision, 1);
        let store = reconciler.store();
        let root = store.result(result_id).unwrap().unwrap();
        assert_eq!(root.kind, ResultKind::Check);
        assert_eq!(root.check.unwrap().notes, 1);

        let b = store.find_source(context, "B").unwrap().unwrap();
        let b_results = store.results(b.id).unwrap();
        assert_eq!(b_results[0].kind, ResultKind::Installation);
        assert_eq!(root.dependencies, BTreeSet::from([b_results[0].id]));
    }

    #[tokio::test]
    async fn test_matching_versions_promote_in_place() {
        let (reconciler, context) = reconciler();
        reconciler
            .reconcile(&check(context, package("A", "2.1"), &[package("B", "1.0")]))
            .await
            .unwrap();

        // B was only installed so far
        let outcome = reconciler
            .reconcile(&check(context, package("B", "1.0"), &[]))
            .await
            .unwrap();

        let ReconcileOutcome::Promoted { result_id } = outcome else {
            panic!("expected a promotion, got {outcome:?}");
        };
        let store = reconciler.store();
        let promoted = store.result(result_id).unwrap().unwrap();
        assert_eq!(promoted.kind, ResultKind::Check);
        assert_eq!(promoted.revision, 1);
        assert_eq!(store.context(context).unwrap().unwrap().revision, 1);
        assert_eq!(result_count(&reconciler, context), 2);
    }

    #[tokio::test]
    async fn test_repeated_check_is_unchanged() {
        let (reconciler, context) = reconciler();
        let message = check(context, package("A", "2.1"), &[package("B", "1.0")]);
        reconciler.reconcile(&message).await.unwrap();

        let outcome = reconciler.reconcile(&message).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        assert_eq!(result_count(&reconciler, context), 2);
    }

    #[tokio::test]
    async fn test_newer_dependency_bumps_revision() {
        let (reconciler, context) = reconciler();
        reconciler
            .reconcile(&check(
                context,
                package("A", "2.1"),
                &[package("B", "1.0"), package("C", "0.3")],
            ))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&check(
                context,
                package("A", "2.1"),
                &[package("B", "1.1"), package("C", "0.3")],
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Advanced { revision: 2, .. }));
        let store = reconciler.store();
        for name in ["B", "C"] {
            let source = store.find_source(context, name).unwrap().unwrap();
            assert_eq!(source.max_revision, 2);
            let latest = &store.results(source.id).unwrap()[0];
            assert_eq!(latest.revision, 2);
            assert_eq!(latest.kind, ResultKind::Installation);
        }
    }

    #[tokio::test]
    async fn test_check_only_dependencies_do_not_bump_revision() {
        // --- Setup ---
        let (reconciler, context) = reconciler();
        let first = reconciler
            .reconcile(&check_with(
                context,
                package("A", "2.1"),
                &[package("B", "1.0")],
                &[package("B", "1.0"), package("C", "0.3")],
            ))
            .await
            .unwrap();
        assert!(matches!(first, ReconcileOutcome::Advanced { revision: 1, .. }));

        // --- Execute: only the suggested C moved on ---
        let second = reconciler
            .reconcile(&check_with(
                context,
                package("A", "2.1"),
                &[package("B", "1.0")],
                &[package("B", "1.0"), package("C", "0.4")],
            ))
            .await
            .unwrap();

        // --- Verify ---
        assert!(matches!(second, ReconcileOutcome::Unchanged { .. }), "{second:?}");
        let store = reconciler.store();
        assert!(store.find_source(context, "C").unwrap().is_none());
        assert_eq!(store.context(context).unwrap().unwrap().revision, 1);
        assert_eq!(result_count(&reconciler, context), 2);
    }

    #[tokio::test]
    async fn test_results_of_different_revisions_start_a_new_one() {
        // --- Setup: B checked at revision 1, A alone at revision 2 ---
        let (reconciler, context) = reconciler();
        reconciler
            .reconcile(&check(context, package("B", "1.0"), &[]))
            .await
            .unwrap();
        let outcome = reconciler
            .reconcile(&check(context, package("A", "2.1"), &[]))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Advanced { revision: 2, .. }));

        // --- Execute: A now reports B as installed ---
        let outcome = reconciler
            .reconcile(&check(context, package("A", "2.1"), &[package("B", "1.0")]))
            .await
            .unwrap();

        // --- Verify ---
        let ReconcileOutcome::Advanced { revision, result_id } = outcome else {
            panic!("expected a new revision, got {outcome:?}");
        };
        assert_eq!(revision, 3);
        let store = reconciler.store();
        let root = store.result(result_id).unwrap().unwrap();
        let b = store.find_source(context, "B").unwrap().unwrap();
        let b_latest = &store.results(b.id).unwrap()[0];
        assert_eq!(b_latest.revision, 3);
        assert_eq!(root.dependencies, BTreeSet::from([b_latest.id]));
    }

    #[test_log::test(tokio::test)]
    async fn test_older_dependency_is_inconsistent() {
        let (reconciler, context) = reconciler();
        reconciler
            .reconcile(&check(context, package("A", "2.1"), &[package("B", "1.0")]))
            .await
            .unwrap();

        let err = reconciler
            .reconcile(&check(context, package("A", "2.1"), &[package("B", "0.9")]))
            .await
            .unwrap_err();

        match err {
            Error::RevisionInconsistency { package, recorded, reported } => {
                assert_eq!(package, "B");
                assert_eq!(recorded.to_string(), "1.0");
                assert_eq!(reported.to_string(), "0.9");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(reconciler.store().context(context).unwrap().unwrap().revision, 1);
        assert_eq!(result_count(&reconciler, context), 2);
    }

    #[tokio::test]
    async fn test_unknown_context_is_dropped() {
        let (reconciler, _) = reconciler();

        let outcome = reconciler
            .reconcile(&check(99, package("A", "2.1"), &[]))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Dropped);

        let mut without = check(1, package("A", "2.1"), &[]);
        if let ResultMessage::Check(m) = &mut without {
            m.context_ref = None;
        }
        assert_eq!(reconciler.reconcile(&without).await.unwrap(), ReconcileOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_exception_is_recorded_as_diagnostic() {
        let (reconciler, context) = reconciler();
        let message = ResultMessage::Exception(ExceptionResultMessage {
            context_ref: Some(context),
            package: PackageResultMessage::from_reference(&PackageReference::named("A"), Some("CRAN")),
            installed_packages: Vec::new(),
            failed_installation: Some(package("B", "1.0")),
            installer: None,
            error: "dependency B of A could not be installed".into(),
        });

        let outcome = reconciler.reconcile(&message).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Recorded { .. }));
        let diagnostics = reconciler.store().diagnostics(context).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].failed_installation.as_deref(), Some("B"));
        assert_eq!(result_count(&reconciler, context), 0);
    }

    #[tokio::test]
    async fn test_concurrent_results_for_one_context_are_serialized() {
        let (reconciler, context) = reconciler();
        let reconciler = Arc::new(reconciler);
        let message = check(context, package("A", "2.1"), &[package("B", "1.0")]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                let message = message.clone();
                tokio::spawn(async move { reconciler.reconcile(&message).await.unwrap() })
            })
            .collect();
        let mut advanced = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReconcileOutcome::Advanced { .. }) {
                advanced += 1;
            }
        }

        assert_eq!(advanced, 1);
        assert_eq!(reconciler.store().context(context).unwrap().unwrap().revision, 1);
    }
}
