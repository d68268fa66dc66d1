//! Extraction of source package archives (`.tar.gz`).

use crate::runtime::Runtime;
use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::path::Path;
use tar::Archive;

#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzExtractor;

impl TarGzExtractor {
    pub fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    /// Unpacks the archive below `extract_to`, keeping its top-level directory.
    #[tracing::instrument(skip(self, runtime))]
    pub fn extract(&self, runtime: &dyn Runtime, archive_path: &Path, extract_to: &Path) -> Result<()> {
        if !self.can_handle(archive_path) {
            bail!("Unsupported archive format: {}", archive_path.display());
        }

        runtime.create_dir_all(extract_to)?;
        let reader = runtime.open(archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(reader));
        archive.set_preserve_permissions(false);
        archive
            .unpack(extract_to)
            .with_context(|| format!("Failed to extract {}", archive_path.display()))
    }
}
