//! Fakes shared by the orchestration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::control::PackageDescription;
use crate::installer::{InstallerHandle, InstallerRegistry, InstallerRun, InstallerSpec, MockInstaller};
use crate::messages::{CheckTaskMessage, InstallerReference, PackageReference, RepositoryReference};
use crate::progress::{ProgressLogReader, ProgressMessage};
use crate::repository::{
    ListingRepository, MockSourceFetcher, RepositoryBackend, RepositoryRegistry, StaticIndex,
};
use crate::version::Version;

pub const INSTALLER_VERSION: &str = "3.0.2";

/// Check log every fake check run reports.
pub const CHECK_LOG: &str = "\
* checking for file 'pkg/DESCRIPTION' ... OK
* checking whether package 'pkg' can be installed ... OK
* checking R code for possible problems ... NOTE
no visible binding for global variable 'x'
* DONE
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerCall {
    pub action: &'static str,
    pub package: String,
    pub library_paths: Vec<PathBuf>,
}

pub type InstallerCalls = Arc<Mutex<Vec<InstallerCall>>>;

/// Installs recorded by `calls`, in call order.
pub fn installed(calls: &InstallerCalls) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| call.action == "install")
        .map(|call| call.package.clone())
        .collect()
}

/// A CRAN-like repository serving `packages` (DESCRIPTION texts). Sources
/// are "fetched" to `<cache>/<name>` without touching the filesystem.
pub fn listing_registry(cache: &Path, packages: &[&str]) -> RepositoryRegistry {
    let index = StaticIndex::new(
        packages
            .iter()
            .map(|text| PackageDescription::parse(text).unwrap()),
    );
    let mut fetcher = MockSourceFetcher::new();
    fetcher
        .expect_fetch()
        .returning(|name, _, cache_dir| Ok(cache_dir.join(name)));

    let cran = ListingRepository::new("CRAN", Arc::new(index), Arc::new(fetcher), cache.to_path_buf());
    let mut registry = RepositoryRegistry::new();
    registry.register(RepositoryBackend::Registry(Arc::new(cran)));
    registry
}

fn package_of(source: &Path) -> String {
    source.file_name().unwrap().to_string_lossy().to_string()
}

/// An installer for OS type `unix` treating `stats` as a core package.
///
/// Installs write the install marker unless the package is in `failing`;
/// checks report [`CHECK_LOG`].
pub fn fake_installer(failing: &'static [&'static str]) -> (InstallerRegistry, InstallerCalls) {
    let calls = InstallerCalls::default();
    let mut installer = MockInstaller::new();
    installer
        .expect_core_package_names()
        .returning(|| vec!["stats".to_string()]);

    let recorded = Arc::clone(&calls);
    installer
        .expect_install_package()
        .returning(move |source, library, _, library_paths| {
            let name = package_of(source);
            recorded.lock().unwrap().push(InstallerCall {
                action: "install",
                package: name.clone(),
                library_paths: library_paths.to_vec(),
            });
            if failing.contains(&name.as_str()) {
                return Ok(InstallerRun {
                    succeeded: false,
                    progress: vec![ProgressMessage {
                        levels: vec![format!("installing *source* package '{name}' ...")],
                        lines: vec!["ERROR: compilation failed".to_string()],
                        status: None,
                    }],
                    ..Default::default()
                });
            }
            std::fs::create_dir_all(library.join(&name)).unwrap();
            std::fs::write(library.join(&name).join("DESCRIPTION"), format!("Package: {name}\n"))
                .unwrap();
            Ok(InstallerRun {
                succeeded: true,
                ..Default::default()
            })
        });

    let recorded = Arc::clone(&calls);
    installer
        .expect_check_package()
        .returning(move |source, _, _, _, library_paths| {
            recorded.lock().unwrap().push(InstallerCall {
                action: "check",
                package: package_of(source),
                library_paths: library_paths.to_vec(),
            });
            let mut reader = ProgressLogReader::new(CHECK_LOG.as_bytes());
            let progress = reader.by_ref().collect::<std::io::Result<Vec<_>>>().unwrap();
            Ok(InstallerRun {
                succeeded: true,
                progress,
                counts: reader.counts().clone(),
            })
        });

    let mut registry = InstallerRegistry::new();
    registry.register(InstallerHandle::new(
        InstallerSpec::new(Version::parse(INSTALLER_VERSION).unwrap()).with_os_type("unix"),
        Arc::new(installer),
    ));
    (registry, calls)
}

/// A task checking `name` from the default `CRAN` repository.
pub fn task(name: &str) -> CheckTaskMessage {
    CheckTaskMessage {
        context_ref: None,
        package: PackageReference::named(name),
        dependencies: Vec::new(),
        default_repository: Some(RepositoryReference::new("CRAN")),
        installer: InstallerReference::new(Version::parse(INSTALLER_VERSION).unwrap()),
    }
}
