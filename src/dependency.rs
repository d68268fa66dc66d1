//! Dependency relations between packages.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::VersionConstraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DependencyType {
    Depends,
    Imports,
    Suggests,
    LinkingTo,
    Enhances,
}

impl DependencyType {
    /// Relations consulted when checking a package.
    pub const CMD_CHECK: &'static [DependencyType] = &[
        DependencyType::Depends,
        DependencyType::Imports,
        DependencyType::Suggests,
        DependencyType::LinkingTo,
        DependencyType::Enhances,
    ];

    /// Relations that must be installed before the package itself.
    pub const CMD_INSTALL: &'static [DependencyType] = &[
        DependencyType::Depends,
        DependencyType::Imports,
        DependencyType::LinkingTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Depends => "DEPENDS",
            DependencyType::Imports => "IMPORTS",
            DependencyType::Suggests => "SUGGESTS",
            DependencyType::LinkingTo => "LINKINGTO",
            DependencyType::Enhances => "ENHANCES",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEPENDS" => Ok(DependencyType::Depends),
            "IMPORTS" => Ok(DependencyType::Imports),
            "SUGGESTS" => Ok(DependencyType::Suggests),
            "LINKINGTO" => Ok(DependencyType::LinkingTo),
            "ENHANCES" => Ok(DependencyType::Enhances),
            _ => anyhow::bail!("Unknown dependency type: {}", s),
        }
    }
}

/// Dependencies grouped by relation.
pub type DependencyMap<T> = BTreeMap<DependencyType, Vec<T>>;

static DEPENDENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^(]+)(?:\(([^)]+)\))?").expect("dependency pattern is valid")
});

/// One declared dependency, e.g. `methods` or `Rcpp (>= 0.11.0)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<VersionConstraint>,
}

impl DependencyInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        let captures = DEPENDENCY_PATTERN
            .captures(entry)
            .ok_or_else(|| Error::resolving(entry, "malformed dependency entry"))?;

        let name = captures[1].trim();
        if name.is_empty() {
            return Err(Error::resolving(entry, "dependency without a name"));
        }
        let constraint = match captures.get(2) {
            Some(text) => VersionConstraint::parse(text.as_str())?,
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionNumber;

    #[test]
    fn test_install_relations_are_a_subset_of_check_relations() {
        for kind in DependencyType::CMD_INSTALL {
            assert!(DependencyType::CMD_CHECK.contains(kind));
        }
        assert_eq!(DependencyType::CMD_CHECK.len(), 5);
        assert!(!DependencyType::CMD_INSTALL.contains(&DependencyType::Suggests));
        assert!(!DependencyType::CMD_INSTALL.contains(&DependencyType::Enhances));
    }

    #[test]
    fn test_dependency_type_parsing() {
        assert_eq!(
            "LinkingTo".parse::<DependencyType>().unwrap(),
            DependencyType::LinkingTo
        );
        assert!("Recommends".parse::<DependencyType>().is_err());
        assert_eq!(DependencyType::Imports.to_string(), "IMPORTS");
    }

    #[test]
    fn test_parse_plain_dependency() {
        let dep = DependencyInfo::parse(" methods ").unwrap();
        assert_eq!(dep.name, "methods");
        assert!(dep.constraint.is_none());
    }

    #[test]
    fn test_parse_dependency_with_constraint() {
        let dep = DependencyInfo::parse("Rcpp (>= 0.11.0)").unwrap();
        assert_eq!(dep.name, "Rcpp");
        let constraint = dep.constraint.unwrap();
        assert_eq!(
            constraint.min,
            Some(VersionNumber::encode("0.11.0").unwrap())
        );
        assert_eq!(constraint.max, None);
    }

    #[test]
    fn test_parse_empty_dependency_fails() {
        assert!(DependencyInfo::parse("(>= 1.0)").is_err());
    }
}
