//! Package repositories.
//!
//! A repository backend turns a package reference into a [`PackageAccessor`].
//! Two kinds of backend exist: registry-style listings (CRAN-like) resolved
//! by package name, and version-control checkouts (SVN-like) resolved by
//! location.

mod checkout;
mod listing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::dependency::{DependencyInfo, DependencyMap};
use crate::error::{Error, Result};
use crate::lease::PathLease;
use crate::messages::PackageResultMessage;
use crate::version::Version;

pub use checkout::{CheckoutAccessor, CheckoutRepository, SvnClient, VcsClient};
pub use listing::{
    HttpSourceFetcher, ListingAccessor, ListingIndex, ListingRepository, PackageIndex,
    SourceFetcher, StaticIndex,
};

#[cfg(test)]
pub use checkout::MockVcsClient;
#[cfg(test)]
pub use listing::{MockPackageIndex, MockSourceFetcher};

/// One resolvable, versioned package from one backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageAccessor: Send + Sync {
    fn source_type(&self) -> String;

    fn source_location(&self) -> Option<String>;

    async fn package_name(&self) -> Result<String>;

    async fn package_version(&self) -> Result<Option<Version>>;

    /// Version of the source this accessor stands for. For checkouts this is
    /// the working-copy revision.
    async fn source_version(&self) -> Result<Version>;

    async fn declared_dependencies(&self) -> Result<DependencyMap<DependencyInfo>>;

    /// Operating system the package is restricted to, if any.
    async fn os_type(&self) -> Result<Option<String>>;

    /// Whether the source can be acquired from the backend.
    async fn is_available(&self) -> bool;

    /// Makes the source available on disk for as long as the lease is held.
    async fn acquire_source(&self) -> Result<PathLease>;
}

/// Best-effort identity of an accessor, for reporting.
pub async fn describe_accessor(accessor: &dyn PackageAccessor) -> Option<PackageResultMessage> {
    let name = accessor.package_name().await.ok()?;
    Some(PackageResultMessage {
        name,
        package_version: accessor.package_version().await.ok().flatten(),
        source_type: accessor.source_type(),
        source_location: accessor.source_location(),
        source_version: accessor.source_version().await.ok(),
        installation: None,
        progress: Vec::new(),
    })
}

#[derive(Clone)]
pub enum RepositoryBackend {
    Registry(Arc<ListingRepository>),
    Checkout(Arc<CheckoutRepository>),
}

impl RepositoryBackend {
    pub fn source_type(&self) -> &str {
        match self {
            RepositoryBackend::Registry(repository) => repository.source_type(),
            RepositoryBackend::Checkout(repository) => repository.source_type(),
        }
    }

    /// Resolves an accessor. Registries look packages up by `name`, checkouts
    /// by `location`; `version` pins the source version.
    pub fn resolve_accessor(
        &self,
        name: Option<&str>,
        location: Option<&str>,
        version: Option<&Version>,
    ) -> Result<Arc<dyn PackageAccessor>> {
        match self {
            RepositoryBackend::Registry(repository) => {
                let name = name.ok_or_else(|| {
                    Error::resolving(
                        location.unwrap_or("<unnamed>"),
                        format!("{} packages need a name", repository.source_type()),
                    )
                })?;
                Ok(repository.accessor(name, version.cloned()))
            }
            RepositoryBackend::Checkout(repository) => {
                let label = name.unwrap_or("<unnamed>");
                let location = location.ok_or_else(|| {
                    Error::resolving(
                        label,
                        format!("{} packages need a location", repository.source_type()),
                    )
                })?;
                let revision = match version {
                    Some(version) => Some(version.revision().ok_or_else(|| {
                        Error::resolving(label, format!("'{version}' is not a revision"))
                    })?),
                    None => None,
                };
                Ok(repository.accessor(location, revision))
            }
        }
    }
}

/// Backends by source type.
#[derive(Clone, Default)]
pub struct RepositoryRegistry {
    backends: HashMap<String, RepositoryBackend>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend` under its source type, replacing any previous one.
    pub fn register(&mut self, backend: RepositoryBackend) {
        debug!("Registering repository {}", backend.source_type());
        self.backends
            .insert(backend.source_type().to_string(), backend);
    }

    pub fn get(&self, source_type: &str) -> Result<&RepositoryBackend> {
        self.backends.get(source_type).ok_or_else(|| {
            Error::resolving(source_type, format!("unknown repository type '{source_type}'"))
        })
    }

    pub fn source_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.backends.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use std::path::PathBuf;

    fn registry() -> RepositoryRegistry {
        let cran = ListingRepository::new(
            "CRAN",
            Arc::new(StaticIndex::default()),
            Arc::new(MockSourceFetcher::new()),
            PathBuf::from("/cache"),
        );
        let svn = CheckoutRepository::new(
            "SVN",
            Arc::new(MockRuntime::new()),
            Arc::new(MockVcsClient::new()),
            PathBuf::from("/checkouts"),
        );

        let mut registry = RepositoryRegistry::new();
        registry.register(RepositoryBackend::Registry(Arc::new(cran)));
        registry.register(RepositoryBackend::Checkout(Arc::new(svn)));
        registry
    }

    #[test]
    fn test_registry_lookup() {
        let registry = registry();
        assert_eq!(registry.source_types(), vec!["CRAN", "SVN"]);
        assert_eq!(registry.get("SVN").unwrap().source_type(), "SVN");

        let err = registry.get("GIT").err().unwrap();
        assert!(matches!(err, Error::PackageResolving { .. }));
    }

    #[test]
    fn test_registry_backend_needs_name() {
        let registry = registry();
        let backend = registry.get("CRAN").unwrap();

        let accessor = backend.resolve_accessor(Some("zoo"), None, None).unwrap();
        assert_eq!(accessor.source_type(), "CRAN");
        assert!(accessor.source_location().is_none());

        let err = backend
            .resolve_accessor(None, Some("https://svn.example/zoo"), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("need a name"));
    }

    #[test]
    fn test_checkout_backend_needs_location_and_revision() {
        let registry = registry();
        let backend = registry.get("SVN").unwrap();

        let accessor = backend
            .resolve_accessor(None, Some("https://svn.example/zoo"), Some(&Version::from_revision(42)))
            .unwrap();
        assert_eq!(accessor.source_location().as_deref(), Some("https://svn.example/zoo"));

        assert!(backend.resolve_accessor(Some("zoo"), None, None).is_err());

        let version = Version::parse("1.2").unwrap();
        let err = backend
            .resolve_accessor(None, Some("https://svn.example/zoo"), Some(&version))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not a revision"));
    }
}
