//! Messages exchanged between the coordinator and workers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::progress::{ProgressMessage, ProgressStatus, StatusCounts};
use crate::version::Version;

/// Where a package comes from: a repository type, optionally a location
/// within it and a pinned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentifier {
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceIdentifier>,
}

impl PackageReference {
    /// A package found by name in the default repository.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            source: None,
        }
    }

    /// A package found by name in an explicit repository.
    pub fn in_repository(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            source: Some(SourceIdentifier {
                source_type: source_type.into(),
                source_location: None,
                source_version: None,
            }),
        }
    }

    /// A package checked out from a location.
    pub fn located(source_type: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: None,
            source: Some(SourceIdentifier {
                source_type: source_type.into(),
                source_location: Some(location.into()),
                source_version: None,
            }),
        }
    }

    /// Pins the source version. Has no effect without a source.
    pub fn at_version(mut self, version: Version) -> Self {
        if let Some(source) = self.source.as_mut() {
            source.source_version = Some(version);
        }
        self
    }

    /// Best human readable identification.
    pub fn label(&self) -> String {
        match (&self.name, &self.source) {
            (Some(name), _) => name.clone(),
            (None, Some(source)) => source
                .source_location
                .clone()
                .unwrap_or_else(|| source.source_type.clone()),
            (None, None) => "<unnamed>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryReference {
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
}

impl RepositoryReference {
    pub fn new(source_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            source_location: None,
        }
    }
}

/// Installer capability a task must run with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallerReference {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl InstallerReference {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            flavor: None,
            architecture: None,
        }
    }
}

impl fmt::Display for InstallerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if let Some(flavor) = &self.flavor {
            write!(f, "-{flavor}")?;
        }
        if let Some(architecture) = &self.architecture {
            write!(f, "/{architecture}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTaskMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<u64>,
    pub package: PackageReference,
    #[serde(default)]
    pub dependencies: Vec<PackageReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_repository: Option<RepositoryReference>,
    pub installer: InstallerReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationOutcome {
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub errors: u32,
    pub warnings: u32,
    pub notes: u32,
    pub skipped: u32,
}

impl CheckOutcome {
    pub fn from_counts(counts: &StatusCounts) -> Self {
        Self {
            errors: counts.get(ProgressStatus::Error),
            warnings: counts.get(ProgressStatus::Warning),
            notes: counts.get(ProgressStatus::Note),
            skipped: counts.get(ProgressStatus::Skipped),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

/// A package as reported back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResultMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<Version>,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<InstallationOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressMessage>,
}

impl PackageResultMessage {
    /// Best-effort identity of a package that could not be resolved.
    pub fn from_reference(reference: &PackageReference, default_type: Option<&str>) -> Self {
        let source = reference.source.as_ref();
        Self {
            name: reference.label(),
            package_version: None,
            source_type: source
                .map(|s| s.source_type.clone())
                .or_else(|| default_type.map(str::to_string))
                .unwrap_or_default(),
            source_location: source.and_then(|s| s.source_location.clone()),
            source_version: source.and_then(|s| s.source_version.clone()),
            installation: None,
            progress: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResultMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<u64>,
    pub package: PackageResultMessage,
    #[serde(default)]
    pub installation_dependencies: Vec<PackageResultMessage>,
    #[serde(default)]
    pub check_dependencies: Vec<PackageResultMessage>,
    pub installer: InstallerReference,
    pub check: CheckOutcome,
    #[serde(default)]
    pub progress: Vec<ProgressMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionResultMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<u64>,
    pub package: PackageResultMessage,
    #[serde(default)]
    pub installed_packages: Vec<PackageResultMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_installation: Option<PackageResultMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer: Option<InstallerReference>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultMessage {
    Check(CheckResultMessage),
    Exception(ExceptionResultMessage),
}

impl ResultMessage {
    pub fn context_ref(&self) -> Option<u64> {
        match self {
            ResultMessage::Check(m) => m.context_ref,
            ResultMessage::Exception(m) => m.context_ref,
        }
    }

    pub fn package(&self) -> &PackageResultMessage {
        match self {
            ResultMessage::Check(m) => &m.package,
            ResultMessage::Exception(m) => &m.package,
        }
    }
}
