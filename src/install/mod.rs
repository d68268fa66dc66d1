//! Installation of packages and their dependencies.
//!
//! An installation is identified by the package, its source version, the
//! installer and the exact set of dependency installations it was built
//! against. Records are kept in an [`InstallationStore`]; concurrent requests
//! for the same record share one installer run.

mod context;
mod record;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use log::{debug, info, warn};

use crate::dependency::DependencyType;
use crate::error::{Error, Result};
use crate::installer::InstallerHandle;
use crate::lease::LeaseTable;
use crate::repository::PackageAccessor;
use crate::resolver::PackageResolved;
use crate::runtime::Runtime;
use crate::scheduler::SingleFlight;

pub use context::InstallationContext;
pub use record::{
    InstallationQuery, InstallationRecord, InstallationStore, MemoryInstallationStore,
    NewInstallation,
};

/// File whose presence in `<library>/<package>` marks a finished installation.
const INSTALL_MARKER: &str = "DESCRIPTION";

/// Dependencies of `package` of the given kinds that have to be installed
/// with `installer`.
///
/// Core packages of the installer are skipped unless their source is
/// available, and so are packages restricted to another operating system.
pub async fn relevant_dependencies(
    package: &PackageResolved,
    kinds: &[DependencyType],
    installer: &InstallerHandle,
) -> Result<Vec<Arc<PackageResolved>>> {
    let mut relevant = Vec::new();
    for dependency in package.dependencies_of(kinds).await? {
        if installer.is_core_package(dependency.name()) {
            let available = match dependency.accessor().await {
                Ok(accessor) => accessor.is_available().await,
                Err(_) => false,
            };
            if !available {
                debug!("{} is provided by the installer", dependency.name());
                continue;
            }
        }

        if let Some(os_type) = dependency.os_type().await?
            && installer.spec().os_type.as_deref() != Some(os_type.as_str())
        {
            debug!("Skipping {}: restricted to {}", dependency.name(), os_type);
            continue;
        }
        relevant.push(dependency);
    }
    Ok(relevant)
}

/// Attributes the failure of `dependency` to `package`. Resolution errors
/// pass through unchanged.
pub(crate) fn dependency_error(package: &str, dependency: &str, error: Error) -> Error {
    match error {
        Error::PackageResolving { .. } => error,
        error => Error::DependencyInstallation {
            package: package.to_string(),
            dependency: dependency.to_string(),
            source: Box::new(error),
        },
    }
}

pub struct InstallationOrchestrator {
    store: Arc<dyn InstallationStore>,
    runtime: Arc<dyn Runtime>,
    library_root: PathBuf,
    installations: SingleFlight<(u64, String), InstallationRecord, Error>,
    libraries: LeaseTable,
}

impl InstallationOrchestrator {
    pub fn new(
        store: Arc<dyn InstallationStore>,
        runtime: Arc<dyn Runtime>,
        library_root: PathBuf,
    ) -> Self {
        Self {
            store,
            runtime,
            library_root,
            installations: SingleFlight::new(),
            libraries: LeaseTable::new(),
        }
    }

    pub fn store(&self) -> &dyn InstallationStore {
        self.store.as_ref()
    }

    /// Number of open installation contexts using the library at `path`.
    pub fn library_holders(&self, path: &Path) -> usize {
        self.libraries.holders(path)
    }

    /// Installs `package` and its install-relevant dependencies.
    ///
    /// The returned context holds the package's record, the dependency
    /// records making up its library path and the leases taken on the way.
    #[tracing::instrument(skip_all, fields(package = %package.name(), installer = %installer.key()))]
    pub async fn acquire_installation(
        &self,
        package: &Arc<PackageResolved>,
        installer: &InstallerHandle,
    ) -> Result<InstallationContext> {
        let context = InstallationContext::new();
        let record = self
            .install(package, installer, &context, Vec::new())
            .await?;
        context.set_installation(record);
        Ok(context)
    }

    fn install<'a>(
        &'a self,
        package: &'a Arc<PackageResolved>,
        installer: &'a InstallerHandle,
        context: &'a InstallationContext,
        ancestors: Vec<String>,
    ) -> BoxFuture<'a, Result<InstallationRecord>> {
        async move {
            let name = package.name();
            if let Some(record) = context.library_package(name) {
                return Ok(record);
            }
            if ancestors.iter().any(|a| a == name) {
                let mut cycle = ancestors.clone();
                cycle.push(name.to_string());
                return Err(Error::resolving(
                    name,
                    format!("dependency cycle {}", cycle.join(" -> ")),
                ));
            }

            let dependencies =
                relevant_dependencies(package, DependencyType::CMD_INSTALL, installer).await?;
            let mut dependency_ids = BTreeSet::new();
            if !dependencies.is_empty() {
                let mut path = ancestors;
                path.push(name.to_string());

                let records = try_join_all(dependencies.iter().map(|dependency| {
                    let path = path.clone();
                    async move {
                        self.install(dependency, installer, context, path)
                            .await
                            .map_err(|e| dependency_error(name, dependency.name(), e))
                    }
                }))
                .await?;

                for record in records {
                    dependency_ids.insert(record.id);
                    context.add_library_package(record);
                }
            }

            self.shared_installation(package, installer, context, dependency_ids)
                .await
        }
        .boxed()
    }

    /// Looks up or creates the record and joins the installer run for it.
    async fn shared_installation(
        &self,
        package: &PackageResolved,
        installer: &InstallerHandle,
        context: &InstallationContext,
        dependencies: BTreeSet<u64>,
    ) -> Result<InstallationRecord> {
        let accessor = package.accessor().await?;
        let source_version = accessor.source_version().await?;
        let spec = installer.spec();

        let query = InstallationQuery {
            package_name: package.name(),
            source_version: &source_version,
            installer_range: spec.dependency_range,
            flavor: spec.flavor.as_deref(),
            architecture: spec.architecture.as_deref(),
            dependencies: &dependencies,
        };
        let new = NewInstallation {
            package_name: package.name().to_string(),
            package_version: accessor.package_version().await?,
            source_type: accessor.source_type(),
            source_location: accessor.source_location(),
            source_version: source_version.clone(),
            installer: installer.reference(),
            dependencies: dependencies.clone(),
        };
        let record = self.store.find_or_insert(&query, new)?;
        if record.is_failed() {
            debug!(
                "{} {} failed before, not retrying",
                record.package_name, record.source_version
            );
            return Err(Error::Installation {
                record: Box::new(record),
            });
        }

        let key = (record.id, installer.key());
        let handle = self.installations.submit(key, || {
            let loader = InstallationLoader {
                store: Arc::clone(&self.store),
                runtime: Arc::clone(&self.runtime),
                library_root: self.library_root.clone(),
                installer: installer.clone(),
                accessor,
                library_paths: context.library_paths().into_iter().collect(),
                record,
            };
            loader.run()
        });
        let record = handle.wait().await?;

        if let Some(path) = &record.library_path {
            context.add_lease(self.libraries.lease(path));
        }
        Ok(record)
    }
}

/// Performs one installation on behalf of every waiter.
struct InstallationLoader {
    store: Arc<dyn InstallationStore>,
    runtime: Arc<dyn Runtime>,
    library_root: PathBuf,
    installer: InstallerHandle,
    accessor: Arc<dyn PackageAccessor>,
    library_paths: Vec<PathBuf>,
    record: InstallationRecord,
}

impl InstallationLoader {
    async fn run(self) -> Result<InstallationRecord> {
        let mut record = self.record;
        let library = self.library_root.join(record.id.to_string());
        let marker = library.join(&record.package_name).join(INSTALL_MARKER);
        let log = self
            .library_root
            .join("logs")
            .join(record.id.to_string())
            .join("install.log");

        if self.runtime.exists(&marker) {
            debug!("{} already installed in {}", record.package_name, library.display());
            if record.failed != Some(false) || record.library_path.as_ref() != Some(&library) {
                record.failed = Some(false);
                record.library_path = Some(library);
                record.log_path.get_or_insert(log);
                self.store.update(&record)?;
            }
            return Ok(record);
        }

        self.runtime.create_dir_all(&library)?;
        if let Some(parent) = log.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        let source = self.accessor.acquire_source().await?;
        info!(
            "Installing {} {} with installer {}",
            record.package_name,
            record.source_version,
            self.installer.key()
        );
        let run = self
            .installer
            .installer()
            .install_package(source.path(), &library, &log, &self.library_paths)
            .await;
        drop(source);
        let run = run?;

        record.failed = Some(!run.succeeded);
        record.progress = run.progress;
        record.library_path = Some(library);
        record.log_path = Some(log);
        self.store.update(&record)?;

        if run.succeeded {
            info!("Installed {} {}", record.package_name, record.source_version);
            Ok(record)
        } else {
            warn!(
                "Installation of {} {} failed",
                record.package_name, record.source_version
            );
            Err(Error::Installation {
                record: Box::new(record),
            })
        }
    }
}
