//! Version-control checkouts (SVN-like).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, bail};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use super::PackageAccessor;
use crate::control::PackageDescription;
use crate::dependency::{DependencyInfo, DependencyMap};
use crate::error::Result;
use crate::lease::{LeaseCounter, PathLease};
use crate::runtime::Runtime;
use crate::version::Version;

/// Working-copy operations of a version-control system. Both operations
/// return the revision of the working copy afterwards.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn checkout(&self, url: &str, dir: &Path, revision: Option<u64>) -> anyhow::Result<u64>;

    async fn update(&self, dir: &Path, revision: Option<u64>) -> anyhow::Result<u64>;
}

/// Runs the `svn` command line client.
pub struct SvnClient {
    program: PathBuf,
}

impl Default for SvnClient {
    fn default() -> Self {
        Self::new("svn")
    }
}

impl SvnClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!("{} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .arg("--non-interactive")
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{} {} failed ({}): {}",
                self.program.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn working_copy_revision(&self, dir: &Path) -> anyhow::Result<u64> {
        let dir = dir.to_string_lossy();
        let output = self.run(&["info", "--show-item", "revision", &dir]).await?;
        output
            .trim()
            .parse()
            .with_context(|| format!("Unexpected revision '{}' of {}", output.trim(), dir))
    }
}

fn revision_arg(revision: Option<u64>) -> String {
    revision.map_or_else(|| "HEAD".to_string(), |r| r.to_string())
}

#[async_trait]
impl VcsClient for SvnClient {
    #[tracing::instrument(skip(self))]
    async fn checkout(&self, url: &str, dir: &Path, revision: Option<u64>) -> anyhow::Result<u64> {
        let target = dir.to_string_lossy();
        let revision = revision_arg(revision);
        self.run(&["checkout", "-r", &revision, url, &target]).await?;
        self.working_copy_revision(dir).await
    }

    #[tracing::instrument(skip(self))]
    async fn update(&self, dir: &Path, revision: Option<u64>) -> anyhow::Result<u64> {
        let target = dir.to_string_lossy();
        let revision = revision_arg(revision);
        self.run(&["update", "-r", &revision, &target]).await?;
        self.working_copy_revision(dir).await
    }
}

/// Packages checked out from a version-control server.
///
/// Accessors are kept per (URL, revision), so every task asking for the same
/// checkout shares its working copy.
pub struct CheckoutRepository {
    source_type: String,
    runtime: Arc<dyn Runtime>,
    client: Arc<dyn VcsClient>,
    work_root: PathBuf,
    accessors: Mutex<HashMap<(String, Option<u64>), Arc<CheckoutAccessor>>>,
}

impl CheckoutRepository {
    pub fn new(
        source_type: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        client: Arc<dyn VcsClient>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            runtime,
            client,
            work_root,
            accessors: Mutex::new(HashMap::new()),
        }
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn accessor(&self, url: &str, revision: Option<u64>) -> Arc<dyn PackageAccessor> {
        let mut accessors = self.accessors.lock().unwrap_or_else(PoisonError::into_inner);
        let accessor = accessors
            .entry((url.to_string(), revision))
            .or_insert_with(|| {
                Arc::new(CheckoutAccessor {
                    source_type: self.source_type.clone(),
                    url: url.to_string(),
                    targeted: revision,
                    dir: self.work_root.join(working_copy_name(url, revision)),
                    runtime: Arc::clone(&self.runtime),
                    client: Arc::clone(&self.client),
                    leases: Arc::new(LeaseCounter::default()),
                    state: tokio::sync::Mutex::new(None),
                })
            });
        Arc::clone(accessor) as Arc<dyn PackageAccessor>
    }
}

/// Directory name of a working copy, derived from its URL.
fn working_copy_name(url: &str, revision: Option<u64>) -> String {
    let stem: String = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest)
        .trim_end_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{}@{}", stem, revision_arg(revision))
}

#[derive(Clone)]
struct CheckedOut {
    revision: u64,
    description: PackageDescription,
}

/// A package at one location and, optionally, one revision. Without a
/// revision the accessor sticks to the first revision it checked out.
pub struct CheckoutAccessor {
    source_type: String,
    url: String,
    targeted: Option<u64>,
    dir: PathBuf,
    runtime: Arc<dyn Runtime>,
    client: Arc<dyn VcsClient>,
    leases: Arc<LeaseCounter>,
    state: tokio::sync::Mutex<Option<CheckedOut>>,
}

impl CheckoutAccessor {
    pub fn working_copy(&self) -> &Path {
        &self.dir
    }

    async fn checked_out(&self) -> Result<CheckedOut> {
        let mut state = self.state.lock().await;
        if let Some(checked_out) = state.as_ref() {
            return Ok(checked_out.clone());
        }

        let revision = if self.runtime.exists(&self.dir.join(".svn")) {
            debug!("Updating working copy {}", self.dir.display());
            self.client.update(&self.dir, self.targeted).await?
        } else {
            info!("Checking out {}", self.url);
            if let Some(parent) = self.dir.parent() {
                self.runtime.create_dir_all(parent)?;
            }
            self.client.checkout(&self.url, &self.dir, self.targeted).await?
        };

        let text = self
            .runtime
            .read_to_string(&self.dir.join("DESCRIPTION"))
            .with_context(|| format!("{} has no DESCRIPTION", self.url))?;
        let description = PackageDescription::parse(&text)?;
        debug!("{} is {} at revision {}", self.url, description.name, revision);

        let checked_out = CheckedOut {
            revision,
            description,
        };
        *state = Some(checked_out.clone());
        Ok(checked_out)
    }
}

#[async_trait]
impl PackageAccessor for CheckoutAccessor {
    fn source_type(&self) -> String {
        self.source_type.clone()
    }

    fn source_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn package_name(&self) -> Result<String> {
        Ok(self.checked_out().await?.description.name)
    }

    async fn package_version(&self) -> Result<Option<Version>> {
        Ok(self.checked_out().await?.description.version)
    }

    async fn source_version(&self) -> Result<Version> {
        Ok(Version::from_revision(self.checked_out().await?.revision))
    }

    async fn declared_dependencies(&self) -> Result<DependencyMap<DependencyInfo>> {
        Ok(self.checked_out().await?.description.dependencies)
    }

    async fn os_type(&self) -> Result<Option<String>> {
        Ok(self.checked_out().await?.description.os_type)
    }

    async fn is_available(&self) -> bool {
        self.checked_out().await.is_ok()
    }

    async fn acquire_source(&self) -> Result<PathLease> {
        self.checked_out().await?;
        Ok(PathLease::tracked(&self.dir, Arc::clone(&self.leases)))
    }
}
