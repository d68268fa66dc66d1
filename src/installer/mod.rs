//! Installer capabilities: the external tool that installs and checks
//! packages for one runtime version, flavor and architecture.

mod rcmd;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::error::{Error, Result};
use crate::messages::InstallerReference;
use crate::progress::{ProgressMessage, StatusCounts};
use crate::version::{Version, VersionNumber};

pub use rcmd::{R_CORE_PACKAGES, RCmdInstaller};

/// Outcome of one install or check invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallerRun {
    pub succeeded: bool,
    pub progress: Vec<ProgressMessage>,
    pub counts: StatusCounts,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Installs the package at `source` into `library`, writing the tool's
    /// output to `log`. `library_paths` are searched for dependencies.
    async fn install_package(
        &self,
        source: &Path,
        library: &Path,
        log: &Path,
        library_paths: &[PathBuf],
    ) -> anyhow::Result<InstallerRun>;

    /// Checks the package at `source` against its installation in
    /// `installed_library`.
    async fn check_package(
        &self,
        source: &Path,
        installed_library: &Path,
        install_log: &Path,
        check_log: &Path,
        library_paths: &[PathBuf],
    ) -> anyhow::Result<InstallerRun>;

    /// Packages shipped with the runtime itself.
    fn core_package_names(&self) -> Vec<String>;
}

/// Static description of a configured installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerSpec {
    pub version: Version,
    /// Installer versions whose installations can be reused, `[min, max)`.
    pub dependency_range: (VersionNumber, VersionNumber),
    pub flavor: Option<String>,
    pub architecture: Option<String>,
    pub os_type: Option<String>,
}

impl InstallerSpec {
    /// An installer whose installations are shared by all patch releases of
    /// its minor version.
    pub fn new(version: Version) -> Self {
        let [major, minor, ..] = *version.number().fields();
        let min = VersionNumber::new([major, minor, 0, 0, 0]);
        let max = VersionNumber::new([major, minor.saturating_add(1), 0, 0, 0]);
        Self {
            version,
            dependency_range: (min, max),
            flavor: None,
            architecture: None,
            os_type: None,
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn with_os_type(mut self, os_type: impl Into<String>) -> Self {
        self.os_type = Some(os_type.into());
        self
    }

    pub fn reference(&self) -> InstallerReference {
        InstallerReference {
            version: self.version.clone(),
            flavor: self.flavor.clone(),
            architecture: self.architecture.clone(),
        }
    }

    /// Whether `reference` asks for this installer. Flavor and architecture
    /// only have to match when the reference names them.
    pub fn matches(&self, reference: &InstallerReference) -> bool {
        self.version == reference.version
            && reference.flavor.as_ref().is_none_or(|f| self.flavor.as_ref() == Some(f))
            && reference
                .architecture
                .as_ref()
                .is_none_or(|a| self.architecture.as_ref() == Some(a))
    }
}

/// A configured installer together with its description.
#[derive(Clone)]
pub struct InstallerHandle {
    spec: Arc<InstallerSpec>,
    installer: Arc<dyn Installer>,
}

impl InstallerHandle {
    pub fn new(spec: InstallerSpec, installer: Arc<dyn Installer>) -> Self {
        Self {
            spec: Arc::new(spec),
            installer,
        }
    }

    pub fn spec(&self) -> &InstallerSpec {
        &self.spec
    }

    pub fn installer(&self) -> &dyn Installer {
        self.installer.as_ref()
    }

    pub fn reference(&self) -> InstallerReference {
        self.spec.reference()
    }

    /// Identity used to share installation work between tasks.
    pub fn key(&self) -> String {
        self.reference().to_string()
    }

    pub fn is_core_package(&self, name: &str) -> bool {
        self.installer.core_package_names().iter().any(|n| n == name)
    }
}

#[derive(Clone, Default)]
pub struct InstallerRegistry {
    handles: Vec<InstallerHandle>,
}

impl InstallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: InstallerHandle) {
        debug!("Registering installer {}", handle.reference());
        self.handles.push(handle);
    }

    /// The first configured installer matching `reference`.
    pub fn find(&self, reference: &InstallerReference) -> Result<InstallerHandle> {
        self.handles
            .iter()
            .find(|handle| handle.spec.matches(reference))
            .cloned()
            .ok_or_else(|| {
                Error::resolving(reference.to_string(), "no matching installer configured")
            })
    }

    pub fn references(&self) -> Vec<InstallerReference> {
        self.handles.iter().map(InstallerHandle::reference).collect()
    }
}
