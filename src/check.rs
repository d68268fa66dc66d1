//! Runs one check task from resolution to result message.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use futures_util::future::try_join_all;
use log::{debug, info, warn};

use crate::dependency::DependencyType;
use crate::error::{Error, Result, describe};
use crate::install::{
    InstallationContext, InstallationOrchestrator, InstallationRecord, dependency_error,
    relevant_dependencies,
};
use crate::messages::{
    CheckOutcome, CheckResultMessage, CheckTaskMessage, ExceptionResultMessage,
    PackageResultMessage, ResultMessage,
};
use crate::repository::describe_accessor;
use crate::resolver::{CheckTaskHolder, DependencyResolver};
use crate::runtime::Runtime;

/// Installations that succeeded while a task ran, reported if it fails.
#[derive(Default)]
struct Installed(Mutex<BTreeMap<u64, InstallationRecord>>);

impl Installed {
    fn note(&self, context: &InstallationContext) {
        let mut records = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for record in context.installation().into_iter().chain(context.library_packages()) {
            records.insert(record.id, record);
        }
    }

    fn records(&self) -> Vec<InstallationRecord> {
        let records = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<_> = records.values().cloned().collect();
        records.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        records
    }
}

pub struct CheckOrchestrator {
    resolver: DependencyResolver,
    installations: Arc<InstallationOrchestrator>,
    runtime: Arc<dyn Runtime>,
    check_root: PathBuf,
    runs: AtomicU64,
}

impl CheckOrchestrator {
    pub fn new(
        resolver: DependencyResolver,
        installations: Arc<InstallationOrchestrator>,
        runtime: Arc<dyn Runtime>,
        check_root: PathBuf,
    ) -> Self {
        Self {
            resolver,
            installations,
            runtime,
            check_root,
            runs: AtomicU64::new(1),
        }
    }

    /// Checks the task's package. Failures are reported as exception results.
    #[tracing::instrument(skip_all, fields(package = %task.package.label()))]
    pub async fn check_task(&self, task: &CheckTaskMessage) -> ResultMessage {
        let holder = match self.resolver.resolve(task).await {
            Ok(holder) => holder,
            Err(e) => {
                warn!("Failed to resolve {}: {}", task.package.label(), describe(&e));
                return ResultMessage::Exception(exception(task, None, Vec::new(), e));
            }
        };

        let installed = Installed::default();
        match self.check_resolved(task, &holder, &installed).await {
            Ok(result) => {
                info!(
                    "Checked {}: {} error(s), {} warning(s), {} note(s)",
                    result.package.name, result.check.errors, result.check.warnings, result.check.notes
                );
                ResultMessage::Check(result)
            }
            Err(e) => {
                warn!("Check of {} failed: {}", holder.package.name(), describe(&e));
                let records = installed.records();
                let installation = records
                    .iter()
                    .chain(e.failed_installation())
                    .find(|r| r.package_name == holder.package.name())
                    .map(PackageResultMessage::from);
                let identity = match installation {
                    Some(identity) => Some(identity),
                    None => match holder.package.accessor().await {
                        Ok(accessor) => describe_accessor(accessor.as_ref()).await,
                        Err(_) => None,
                    },
                };
                ResultMessage::Exception(exception(task, identity, records, e))
            }
        }
    }

    async fn check_resolved(
        &self,
        task: &CheckTaskMessage,
        holder: &CheckTaskHolder,
        installed: &Installed,
    ) -> Result<CheckResultMessage> {
        let package = &holder.package;
        let installer = &holder.installer;
        let accessor = package.accessor().await?;

        let source = accessor.acquire_source();
        let root = async {
            let context = self
                .installations
                .acquire_installation(package, installer)
                .await?;
            installed.note(&context);
            Ok::<_, Error>(context)
        };
        let dependencies = async {
            let dependencies =
                relevant_dependencies(package, DependencyType::CMD_CHECK, installer).await?;
            try_join_all(dependencies.iter().map(|dependency| async move {
                let context = self
                    .installations
                    .acquire_installation(dependency, installer)
                    .await
                    .map_err(|e| dependency_error(package.name(), dependency.name(), e))?;
                installed.note(&context);
                Ok::<_, Error>(context)
            }))
            .await
        };
        let (source, root, dependencies) = tokio::try_join!(source, root, dependencies)?;

        let record = root
            .installation()
            .context("Installation context without record")?;
        let library = record
            .library_path
            .clone()
            .context("Installation without library")?;
        let install_log = record
            .log_path
            .clone()
            .context("Installation without log")?;

        let mut library_paths = BTreeSet::from([library.clone()]);
        library_paths.extend(root.library_paths());
        for context in &dependencies {
            if let Some(path) = context.installation().and_then(|r| r.library_path) {
                library_paths.insert(path);
            }
            library_paths.extend(context.library_paths());
        }
        let library_paths: Vec<PathBuf> = library_paths.into_iter().collect();

        let run_dir = self.check_root.join(format!(
            "{}-{}",
            record.id,
            self.runs.fetch_add(1, Ordering::SeqCst)
        ));
        self.runtime.create_dir_all(&run_dir)?;
        let check_log = run_dir.join("check.log");
        debug!(
            "Checking {} with {} library path(s)",
            record.package_name,
            library_paths.len()
        );
        let run = installer
            .installer()
            .check_package(source.path(), &library, &install_log, &check_log, &library_paths)
            .await?;
        drop(source);

        let result = CheckResultMessage {
            context_ref: task.context_ref,
            package: PackageResultMessage::from(&record),
            installation_dependencies: root
                .library_packages()
                .iter()
                .map(PackageResultMessage::from)
                .collect(),
            check_dependencies: dependencies
                .iter()
                .filter_map(InstallationContext::installation)
                .map(|r| PackageResultMessage::from(&r))
                .collect(),
            installer: installer.reference(),
            check: CheckOutcome::from_counts(&run.counts),
            progress: run.progress,
        };

        root.close();
        for context in &dependencies {
            context.close();
        }
        Ok(result)
    }
}

fn exception(
    task: &CheckTaskMessage,
    identity: Option<PackageResultMessage>,
    installed: Vec<InstallationRecord>,
    error: Error,
) -> ExceptionResultMessage {
    let default_type = task
        .default_repository
        .as_ref()
        .map(|r| r.source_type.as_str());
    ExceptionResultMessage {
        context_ref: task.context_ref,
        package: identity
            .unwrap_or_else(|| PackageResultMessage::from_reference(&task.package, default_type)),
        installed_packages: installed.iter().map(PackageResultMessage::from).collect(),
        failed_installation: error.failed_installation().map(PackageResultMessage::from),
        installer: Some(task.installer.clone()),
        error: describe(&error),
    }
}
