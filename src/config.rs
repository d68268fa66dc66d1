use anyhow::{Context, Result};
use log::debug;
use reqwest::Client;

use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    check::CheckOrchestrator,
    http::HttpClient,
    install::{InstallationOrchestrator, MemoryInstallationStore},
    installer::{InstallerHandle, InstallerRegistry, InstallerSpec, RCmdInstaller},
    repository::{
        CheckoutRepository, HttpSourceFetcher, ListingIndex, ListingRepository, RepositoryBackend,
        RepositoryRegistry, SvnClient,
    },
    resolver::DependencyResolver,
    runtime::Runtime,
    version::Version,
};

pub const DEFAULT_CRAN_URL: &str = "https://cloud.r-project.org";
pub const REGISTRY_SOURCE_TYPE: &str = "CRAN";
pub const CHECKOUT_SOURCE_TYPE: &str = "SVN";

/// Everything a worker needs to assemble its services.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub root: PathBuf,
    pub cran_url: String,
    pub r_program: PathBuf,
    pub svn_program: PathBuf,
    pub installer_version: Version,
    pub flavor: Option<String>,
    pub architecture: Option<String>,
    pub os_type: Option<String>,
    pub consumers: usize,
    pub pool_size: usize,
}

impl WorkerConfig {
    pub fn new(root: PathBuf, installer_version: Version) -> Self {
        Self {
            root,
            cran_url: DEFAULT_CRAN_URL.to_string(),
            r_program: PathBuf::from("R"),
            svn_program: PathBuf::from("svn"),
            installer_version,
            flavor: None,
            architecture: None,
            os_type: Some(if cfg!(windows) { "windows" } else { "unix" }.to_string()),
            consumers: 1,
            pool_size: 2,
        }
    }

    /// `<data dir>/pkgcheck`, used when no root is given.
    pub fn default_root(runtime: &dyn Runtime) -> Result<PathBuf> {
        runtime
            .data_dir()
            .map(|dir| dir.join("pkgcheck"))
            .context("Could not determine a data directory, pass --root")
    }

    pub fn library_root(&self) -> PathBuf {
        self.root.join("library")
    }

    pub fn check_root(&self) -> PathBuf {
        self.root.join("checks")
    }

    pub fn source_cache(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn checkout_root(&self) -> PathBuf {
        self.root.join("checkouts")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("spool")
    }

    pub fn installations_file(&self) -> PathBuf {
        self.root.join("installations.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("history.json")
    }

    pub fn installer_spec(&self) -> InstallerSpec {
        let mut spec = InstallerSpec::new(self.installer_version.clone());
        spec.flavor = self.flavor.clone();
        spec.architecture = self.architecture.clone();
        spec.os_type = self.os_type.clone();
        spec
    }

    pub fn repositories(&self, runtime: Arc<dyn Runtime>) -> Result<RepositoryRegistry> {
        let client = Client::builder()
            .user_agent(concat!("pkgcheck/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let http = HttpClient::new(client);

        let cran = ListingRepository::new(
            REGISTRY_SOURCE_TYPE,
            Arc::new(ListingIndex::new(http.clone(), &self.cran_url)),
            Arc::new(HttpSourceFetcher::new(Arc::clone(&runtime), http, &self.cran_url)),
            self.source_cache(),
        );
        let svn = CheckoutRepository::new(
            CHECKOUT_SOURCE_TYPE,
            runtime,
            Arc::new(SvnClient::new(&self.svn_program)),
            self.checkout_root(),
        );

        let mut registry = RepositoryRegistry::new();
        registry.register(RepositoryBackend::Registry(Arc::new(cran)));
        registry.register(RepositoryBackend::Checkout(Arc::new(svn)));
        Ok(registry)
    }

    pub fn installers(&self) -> InstallerRegistry {
        let mut registry = InstallerRegistry::new();
        registry.register(InstallerHandle::new(
            self.installer_spec(),
            Arc::new(RCmdInstaller::new(&self.r_program)),
        ));
        registry
    }

    /// Assembles the check pipeline. Installation records are kept in
    /// [`Self::installations_file`].
    pub fn check_orchestrator(&self, runtime: Arc<dyn Runtime>) -> Result<CheckOrchestrator> {
        debug!("Using pkgcheck root {}", self.root.display());
        let store = MemoryInstallationStore::open(Arc::clone(&runtime), self.installations_file())?;
        let installations =
            InstallationOrchestrator::new(Arc::new(store), Arc::clone(&runtime), self.library_root());
        let resolver = DependencyResolver::new(
            Arc::new(self.repositories(Arc::clone(&runtime))?),
            Arc::new(self.installers()),
        );
        Ok(CheckOrchestrator::new(
            resolver,
            Arc::new(installations),
            runtime,
            self.check_root(),
        ))
    }
}
