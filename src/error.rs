//! Error taxonomy of the orchestration core.
//!
//! Collaborators (filesystem, HTTP, processes, transports) report `anyhow`
//! errors with context; the core classifies failures into [`Error`] so that
//! check orchestration can report which installation failed.

use std::sync::Arc;

use crate::install::InstallationRecord;
use crate::scheduler::FlightError;
use crate::version::Version;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid version '{0}'")]
    VersionFormat(String),

    #[error("package {name} not found in {repository}")]
    PackageNotFound { name: String, repository: String },

    #[error("failed to resolve package {package}: {reason}")]
    PackageResolving { package: String, reason: String },

    #[error("installation of {} {} failed", .record.package_name, .record.source_version)]
    Installation { record: Box<InstallationRecord> },

    #[error("dependency {dependency} of {package} could not be installed")]
    DependencyInstallation {
        package: String,
        dependency: String,
        #[source]
        source: Box<Error>,
    },

    #[error(
        "recorded version {recorded} of {package} is newer than the reported version {reported}"
    )]
    RevisionInconsistency {
        package: String,
        recorded: Version,
        reported: Version,
    },

    /// Failure of a computation shared between several waiters.
    #[error("shared task failed: {0}")]
    Shared(#[source] Arc<Error>),

    #[error("task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn resolving(package: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::PackageResolving {
            package: package.into(),
            reason: reason.to_string(),
        }
    }

    /// Finds the installation record whose failure caused this error, if any.
    pub fn failed_installation(&self) -> Option<&InstallationRecord> {
        match self {
            Error::Installation { record } => Some(record),
            Error::DependencyInstallation { source, .. } => source.failed_installation(),
            Error::Shared(inner) => inner.failed_installation(),
            _ => None,
        }
    }
}

impl From<FlightError<Error>> for Error {
    fn from(error: FlightError<Error>) -> Self {
        match error {
            FlightError::Failed(inner) => Error::Shared(inner),
            FlightError::Cancelled => Error::Cancelled,
        }
    }
}

/// Renders an error with all of its causes on one line.
pub fn describe(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut cause = error.source();
    while let Some(inner) = cause {
        let message = inner.to_string();
        if !text.contains(&message) {
            text.push_str(": ");
            text.push_str(&message);
        }
        cause = inner.source();
    }
    text
}
