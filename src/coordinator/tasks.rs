//! Check tasks built from the recorded history of a context: packages seen
//! before are sent with the source and dependencies they were last checked
//! against.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use log::debug;

use super::store::{PackageSource, ResultStore};
use crate::messages::{
    CheckTaskMessage, InstallerReference, PackageReference, RepositoryReference, SourceIdentifier,
};

/// Builds check tasks from what the coordinator knows about a context.
pub struct CheckTaskPlanner {
    store: Arc<dyn ResultStore>,
    default_repository: RepositoryReference,
    installer: InstallerReference,
}

impl CheckTaskPlanner {
    pub fn new(
        store: Arc<dyn ResultStore>,
        default_repository: RepositoryReference,
        installer: InstallerReference,
    ) -> Self {
        Self {
            store,
            default_repository,
            installer,
        }
    }

    /// A task checking `package` in the context.
    ///
    /// A package the context has seen before keeps its recorded source, and
    /// the sources its latest dependency snapshot was built from are passed
    /// along as known dependencies.
    pub fn plan(&self, context_id: u64, package: &str) -> Result<CheckTaskMessage> {
        let context = self
            .store
            .context(context_id)?
            .ok_or_else(|| anyhow!("Unknown context {}", context_id))?;

        let mut task = CheckTaskMessage {
            context_ref: Some(context.id),
            package: PackageReference::named(package),
            dependencies: Vec::new(),
            default_repository: Some(self.default_repository.clone()),
            installer: self.installer.clone(),
        };

        let Some(source) = self.store.find_source(context.id, package)? else {
            debug!("{} is new to context {}", package, context.name);
            return Ok(task);
        };
        task.package = reference(&source);

        let results = self.store.results(source.id)?;
        if let Some(latest) = results.iter().find(|r| !r.dependencies.is_empty()) {
            for id in &latest.dependencies {
                let Some(result) = self.store.result(*id)? else {
                    continue;
                };
                if let Some(dependency) = self.store.source(result.source_id)? {
                    task.dependencies.push(reference(&dependency));
                }
            }
        }
        debug!(
            "Planned {} in context {} with {} known dependencies",
            package,
            context.name,
            task.dependencies.len()
        );
        Ok(task)
    }
}

fn reference(source: &PackageSource) -> PackageReference {
    PackageReference {
        name: Some(source.package_name.clone()),
        source: Some(SourceIdentifier {
            source_type: source.source_type.clone(),
            source_location: source.source_location.clone(),
            source_version: None,
        }),
    }
}
