//! Registry-style repositories (CRAN-like).
//!
//! Packages are looked up by name in a `PACKAGES` listing and their sources
//! are downloaded as `<name>_<version>.tar.gz` archives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::OnceCell;

use super::PackageAccessor;
use crate::archive::TarGzExtractor;
use crate::cleanup::CleanupGuard;
use crate::control::{ControlFileReader, PackageDescription};
use crate::dependency::{DependencyInfo, DependencyMap};
use crate::error::{Error, Result};
use crate::http::{HttpClient, is_not_found};
use crate::lease::{LeaseTable, PathLease};
use crate::runtime::Runtime;
use crate::scheduler::SingleFlight;
use crate::version::{Version, VersionNumber};

/// Package descriptions of one registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Description of `name` at `version`, or of its latest listed version.
    async fn describe(&self, name: &str, version: Option<Version>) -> Result<Option<PackageDescription>>;
}

type Listing = HashMap<String, Vec<PackageDescription>>;

fn group_by_name(descriptions: impl IntoIterator<Item = PackageDescription>) -> Listing {
    let mut listing = Listing::new();
    for description in descriptions {
        listing
            .entry(description.name.clone())
            .or_default()
            .push(description);
    }
    listing
}

fn lookup(listing: &Listing, name: &str, version: Option<&Version>) -> Option<PackageDescription> {
    let candidates = listing.get(name)?;
    match version {
        Some(version) => candidates
            .iter()
            .find(|d| d.version.as_ref() == Some(version))
            .cloned(),
        None => candidates.iter().max_by(|a, b| a.version.cmp(&b.version)).cloned(),
    }
}

/// A fixed set of descriptions.
#[derive(Debug, Default)]
pub struct StaticIndex {
    listing: Listing,
}

impl StaticIndex {
    pub fn new(descriptions: impl IntoIterator<Item = PackageDescription>) -> Self {
        Self {
            listing: group_by_name(descriptions),
        }
    }
}

#[async_trait]
impl PackageIndex for StaticIndex {
    async fn describe(&self, name: &str, version: Option<Version>) -> Result<Option<PackageDescription>> {
        Ok(lookup(&self.listing, name, version.as_ref()))
    }
}

/// The `src/contrib/PACKAGES` listing of a repository, loaded on first use.
pub struct ListingIndex {
    http: HttpClient,
    base_url: String,
    listing: OnceCell<Listing>,
}

impl ListingIndex {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            listing: OnceCell::new(),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn load(&self) -> anyhow::Result<Listing> {
        let url = format!("{}/src/contrib/PACKAGES", self.base_url.trim_end_matches('/'));
        info!("Loading package listing {}", url);
        let text = self.http.get_text(&url).await?;

        let mut descriptions = Vec::new();
        for record in ControlFileReader::new(text.as_bytes()) {
            let record = record.with_context(|| format!("Failed to read {url}"))?;
            match PackageDescription::from_record(&record) {
                Ok(description) => descriptions.push(description),
                Err(e) => warn!("Skipping listing entry: {}", e),
            }
        }
        debug!("{} lists {} package(s)", url, descriptions.len());
        Ok(group_by_name(descriptions))
    }
}

#[async_trait]
impl PackageIndex for ListingIndex {
    async fn describe(&self, name: &str, version: Option<Version>) -> Result<Option<PackageDescription>> {
        let listing = self.listing.get_or_try_init(|| self.load()).await?;
        Ok(lookup(listing, name, version.as_ref()))
    }
}

/// Puts unpacked package sources into a cache directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Makes the source of `name` `version` available below `cache_dir` and
    /// returns the package directory.
    async fn fetch(&self, name: &str, version: &Version, cache_dir: &Path) -> anyhow::Result<PathBuf>;
}

/// Downloads source archives from a repository over HTTP.
pub struct HttpSourceFetcher {
    runtime: Arc<dyn Runtime>,
    http: HttpClient,
    base_url: String,
    extractor: TarGzExtractor,
}

impl HttpSourceFetcher {
    pub fn new(runtime: Arc<dyn Runtime>, http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            runtime,
            http,
            base_url: base_url.into(),
            extractor: TarGzExtractor,
        }
    }

    fn archive_urls(&self, name: &str, file_name: &str) -> (String, String) {
        let contrib = format!("{}/src/contrib", self.base_url.trim_end_matches('/'));
        (
            format!("{contrib}/{file_name}"),
            format!("{contrib}/Archive/{name}/{file_name}"),
        )
    }

    async fn download(&self, name: &str, file_name: &str, archive: &Path) -> anyhow::Result<()> {
        let (current, archived) = self.archive_urls(name, file_name);
        let create = || self.runtime.create_file(archive);

        match self.http.download_file(&current, create).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!("{} is not current, trying the archive", file_name);
                self.http
                    .download_file(&archived, create)
                    .await
                    .map(|_| ())
                    .with_context(|| format!("Failed to download {archived}"))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to download {current}")),
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    #[tracing::instrument(skip(self, cache_dir))]
    async fn fetch(&self, name: &str, version: &Version, cache_dir: &Path) -> anyhow::Result<PathBuf> {
        let stem = format!("{name}_{version}");
        let target = cache_dir.join(&stem);
        let package_dir = target.join(name);
        if self.runtime.exists(&package_dir.join("DESCRIPTION")) {
            debug!("Using cached source {}", package_dir.display());
            return Ok(package_dir);
        }

        self.runtime.create_dir_all(cache_dir)?;
        let archive = cache_dir.join(format!("{stem}.tar.gz"));
        let mut guard = CleanupGuard::new(Arc::clone(&self.runtime));
        guard.add(&archive);
        guard.add(&target);

        info!("Fetching source of {} {}", name, version);
        self.download(name, &format!("{stem}.tar.gz"), &archive).await?;
        self.extractor
            .extract(self.runtime.as_ref(), &archive, &target)?;
        if !self.runtime.is_dir(&package_dir) {
            bail!("{} does not contain a {} directory", archive.display(), name);
        }

        guard.success();
        if let Err(e) = self.runtime.remove_file(&archive) {
            warn!("Failed to remove {}: {}", archive.display(), e);
        }
        Ok(package_dir)
    }
}

/// A registry of source packages looked up by name.
pub struct ListingRepository {
    source_type: String,
    index: Arc<dyn PackageIndex>,
    fetcher: Arc<dyn SourceFetcher>,
    cache_dir: PathBuf,
    sources: SingleFlight<(String, VersionNumber), PathBuf, Error>,
    leases: LeaseTable,
}

impl ListingRepository {
    pub fn new(
        source_type: impl Into<String>,
        index: Arc<dyn PackageIndex>,
        fetcher: Arc<dyn SourceFetcher>,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            index,
            fetcher,
            cache_dir,
            sources: SingleFlight::new(),
            leases: LeaseTable::new(),
        }
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn accessor(self: &Arc<Self>, name: &str, version: Option<Version>) -> Arc<dyn PackageAccessor> {
        Arc::new(ListingAccessor {
            repository: Arc::clone(self),
            name: name.to_string(),
            requested: version,
            description: OnceCell::new(),
        })
    }

    /// Number of leases currently held on a fetched source directory.
    pub fn source_holders(&self, path: &Path) -> usize {
        self.leases.holders(path)
    }

    async fn acquire(&self, name: &str, version: &Version) -> Result<PathLease> {
        let handle = self.sources.submit((name.to_string(), version.number()), || {
            let fetcher = Arc::clone(&self.fetcher);
            let cache_dir = self.cache_dir.clone();
            let name = name.to_string();
            let version = version.clone();
            async move {
                fetcher
                    .fetch(&name, &version, &cache_dir)
                    .await
                    .map_err(Error::from)
            }
        });
        let path = handle.wait().await?;

        Ok(self.leases.lease(path))
    }
}

/// A package of a [`ListingRepository`]: a name and an optionally pinned
/// version. Two accessors with the same name and version are the same
/// package.
pub struct ListingAccessor {
    repository: Arc<ListingRepository>,
    name: String,
    requested: Option<Version>,
    description: OnceCell<PackageDescription>,
}

impl ListingAccessor {
    async fn description(&self) -> Result<&PackageDescription> {
        self.description
            .get_or_try_init(|| async {
                let description = self
                    .repository
                    .index
                    .describe(&self.name, self.requested.clone())
                    .await?;
                description.ok_or_else(|| match &self.requested {
                    Some(version) => {
                        Error::resolving(&self.name, format!("version {version} is not listed"))
                    }
                    None => Error::PackageNotFound {
                        name: self.name.clone(),
                        repository: self.repository.source_type.clone(),
                    },
                })
            })
            .await
    }
}

impl PartialEq for ListingAccessor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.requested == other.requested
            && Arc::ptr_eq(&self.repository, &other.repository)
    }
}

#[async_trait]
impl PackageAccessor for ListingAccessor {
    fn source_type(&self) -> String {
        self.repository.source_type.clone()
    }

    fn source_location(&self) -> Option<String> {
        None
    }

    async fn package_name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn package_version(&self) -> Result<Option<Version>> {
        self.source_version().await.map(Some)
    }

    async fn source_version(&self) -> Result<Version> {
        if let Some(version) = &self.requested {
            return Ok(version.clone());
        }
        self.description()
            .await?
            .version
            .clone()
            .ok_or_else(|| Error::resolving(&self.name, "listing entry without Version"))
    }

    async fn declared_dependencies(&self) -> Result<DependencyMap<DependencyInfo>> {
        Ok(self.description().await?.dependencies.clone())
    }

    async fn os_type(&self) -> Result<Option<String>> {
        Ok(self.description().await?.os_type.clone())
    }

    async fn is_available(&self) -> bool {
        self.description().await.is_ok()
    }

    async fn acquire_source(&self) -> Result<PathLease> {
        let version = self.source_version().await?;
        self.repository.acquire(&self.name, &version).await
    }
}
