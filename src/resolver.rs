//! Turns a check task into a graph of package accessors.
//!
//! Every task gets its own [`ResolutionContext`]. Within a context a package
//! name maps to exactly one [`PackageResolved`] node; nodes resolve their
//! accessor and their declared dependencies lazily and remember the result.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, warn};
use tokio::sync::OnceCell;

use crate::dependency::{DependencyMap, DependencyType};
use crate::error::{Error, Result};
use crate::installer::{InstallerHandle, InstallerRegistry};
use crate::messages::{CheckTaskMessage, PackageReference};
use crate::repository::{PackageAccessor, RepositoryBackend, RepositoryRegistry};

/// Per-task resolution state.
pub struct ResolutionContext {
    repositories: Arc<RepositoryRegistry>,
    default_repository: Option<RepositoryBackend>,
    nodes: Mutex<HashMap<String, Arc<PackageResolved>>>,
}

impl ResolutionContext {
    fn accessor_for(&self, reference: &PackageReference) -> Result<Arc<dyn PackageAccessor>> {
        let name = reference.name.as_deref();
        if let Some(source) = &reference.source {
            let backend = self.repositories.get(&source.source_type)?;
            return backend.resolve_accessor(
                name,
                source.source_location.as_deref(),
                source.source_version.as_ref(),
            );
        }

        let name = name.ok_or_else(|| Error::resolving(reference.label(), "No name set"))?;
        let default = self
            .default_repository
            .as_ref()
            .ok_or_else(|| Error::resolving(name, "No repository set"))?;
        default.resolve_accessor(Some(name), None, None)
    }

    /// The node registered under `name`, created by `create` if there is none.
    fn node(
        &self,
        name: &str,
        create: impl FnOnce() -> PackageResolved,
    ) -> Arc<PackageResolved> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            nodes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(create())),
        )
    }

    pub fn node_names(&self) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = nodes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registers a node for `reference`, asking its accessor for the package
/// name when the reference only carries a location.
async fn register(
    context: &Arc<ResolutionContext>,
    reference: &PackageReference,
) -> Result<Arc<PackageResolved>> {
    let (name, accessor) = match &reference.name {
        Some(name) => (name.clone(), OnceCell::new()),
        None => {
            let accessor = context.accessor_for(reference)?;
            let name = accessor.package_name().await?;
            (name, OnceCell::new_with(Some(accessor)))
        }
    };

    let node = context.node(&name, || PackageResolved {
        context: Arc::downgrade(context),
        name: name.clone(),
        reference: reference.clone(),
        accessor,
        dependencies: OnceCell::new(),
    });
    if node.reference != *reference {
        warn!("Ignoring a second, different reference to {}", name);
    }
    Ok(node)
}

/// One package of a task's dependency graph.
pub struct PackageResolved {
    context: Weak<ResolutionContext>,
    name: String,
    reference: PackageReference,
    accessor: OnceCell<Arc<dyn PackageAccessor>>,
    dependencies: OnceCell<DependencyMap<Arc<PackageResolved>>>,
}

impl PackageResolved {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> &PackageReference {
        &self.reference
    }

    fn context(&self) -> Result<Arc<ResolutionContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::resolving(&self.name, "resolution context is gone"))
    }

    pub async fn accessor(&self) -> Result<Arc<dyn PackageAccessor>> {
        self.accessor
            .get_or_try_init(|| async { self.context()?.accessor_for(&self.reference) })
            .await
            .cloned()
    }

    /// Declared dependencies, resolved to nodes of the same context.
    pub async fn dependencies(&self) -> Result<&DependencyMap<Arc<PackageResolved>>> {
        self.dependencies
            .get_or_try_init(|| async {
                let declared = self.accessor().await?.declared_dependencies().await?;
                let context = self.context()?;

                let mut resolved = DependencyMap::new();
                for (kind, infos) in declared {
                    let nodes = infos
                        .iter()
                        .map(|info| {
                            context.node(&info.name, || PackageResolved {
                                context: Arc::downgrade(&context),
                                name: info.name.clone(),
                                reference: PackageReference::named(&info.name),
                                accessor: OnceCell::new(),
                                dependencies: OnceCell::new(),
                            })
                        })
                        .collect();
                    resolved.insert(kind, nodes);
                }
                debug!("Resolved dependencies of {}", self.name);
                Ok(resolved)
            })
            .await
    }

    /// Dependencies of the given kinds, each package once, in declaration order.
    pub async fn dependencies_of(&self, kinds: &[DependencyType]) -> Result<Vec<Arc<PackageResolved>>> {
        let dependencies = self.dependencies().await?;
        let mut seen = BTreeSet::new();
        Ok(kinds
            .iter()
            .filter_map(|kind| dependencies.get(kind))
            .flatten()
            .filter(|node| seen.insert(node.name.clone()))
            .cloned()
            .collect())
    }

    pub async fn os_type(&self) -> Result<Option<String>> {
        self.accessor().await?.os_type().await
    }
}

/// A resolved task: the root package and the installer to use.
///
/// Holds the resolution context alive for as long as the task runs.
pub struct CheckTaskHolder {
    pub package: Arc<PackageResolved>,
    pub installer: InstallerHandle,
    context: Arc<ResolutionContext>,
}

impl CheckTaskHolder {
    pub fn context(&self) -> &ResolutionContext {
        &self.context
    }
}

pub struct DependencyResolver {
    repositories: Arc<RepositoryRegistry>,
    installers: Arc<InstallerRegistry>,
}

impl DependencyResolver {
    pub fn new(repositories: Arc<RepositoryRegistry>, installers: Arc<InstallerRegistry>) -> Self {
        Self {
            repositories,
            installers,
        }
    }

    #[tracing::instrument(skip(self, task), fields(package = %task.package.label()))]
    pub async fn resolve(&self, task: &CheckTaskMessage) -> Result<CheckTaskHolder> {
        let installer = self.installers.find(&task.installer)?;
        let default_repository = match &task.default_repository {
            Some(reference) => Some(self.repositories.get(&reference.source_type)?.clone()),
            None => None,
        };

        let context = Arc::new(ResolutionContext {
            repositories: Arc::clone(&self.repositories),
            default_repository,
            nodes: Mutex::new(HashMap::new()),
        });

        // The root goes first so a known dependency cannot replace it
        let package = register(&context, &task.package).await?;
        for dependency in &task.dependencies {
            register(&context, dependency).await?;
        }
        debug!(
            "Task for {} knows {} package(s)",
            package.name(),
            context.node_names().len()
        );

        Ok(CheckTaskHolder {
            package,
            installer,
            context,
        })
    }
}
