//! Control file parsing (`DESCRIPTION` files and `PACKAGES` listings).
//!
//! A control file is a sequence of records separated by blank lines. Each
//! record holds `Tag: value` fields; lines starting with whitespace continue
//! the previous field.

use std::io::{self, BufRead};

use serde::{Deserialize, Serialize};

use crate::dependency::{DependencyInfo, DependencyMap, DependencyType};
use crate::error::{Error, Result};
use crate::version::{Version, VersionConstraint};

/// Fields of one record in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlRecord {
    fields: Vec<(String, String)>,
}

impl ControlRecord {
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(t, v)| (t.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Iterator over the records of a control file.
pub struct ControlFileReader<R> {
    lines: io::Lines<R>,
}

impl<R: BufRead> ControlFileReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: input.lines(),
        }
    }
}

impl<R: BufRead> Iterator for ControlFileReader<R> {
    type Item = io::Result<ControlRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = ControlRecord::default();

        for line in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };

            if line.trim().is_empty() {
                if record.is_empty() {
                    continue;
                }
                return Some(Ok(record));
            }

            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = record.fields.last_mut() {
                    value.push_str(&line[1..]);
                }
                continue;
            }

            match line.split_once(':') {
                Some((tag, value)) => record
                    .fields
                    .push((tag.trim().to_string(), value.trim().to_string())),
                None => log::debug!("Ignoring control line without a tag: {}", line),
            }
        }

        (!record.is_empty()).then_some(Ok(record))
    }
}

/// Parses all records of a control file held in memory.
pub fn parse_records(text: &str) -> io::Result<Vec<ControlRecord>> {
    ControlFileReader::new(text.as_bytes()).collect()
}

/// Package metadata read from a `DESCRIPTION` file or a `PACKAGES` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDescription {
    pub name: String,
    pub version: Option<Version>,
    pub license: Option<String>,
    pub os_type: Option<String>,
    pub needs_compilation: bool,
    /// Constraint on the runtime itself, from a `Depends` entry on `R`.
    pub runtime_constraint: Option<VersionConstraint>,
    pub dependencies: DependencyMap<DependencyInfo>,
}

enum FieldValue<'a> {
    Scalar(&'a str),
    List(Vec<&'a str>),
}

enum FieldKind {
    Scalar,
    List,
}

type Setter = fn(&mut PackageDescription, FieldValue<'_>) -> Result<()>;

/// Name of the runtime entry in `Depends`.
const RUNTIME_PACKAGE: &str = "R";

/// Tags read into a [`PackageDescription`]; everything else is ignored.
const DESCRIPTION_FIELDS: &[(&str, FieldKind, Setter)] = &[
    ("Package", FieldKind::Scalar, set_name),
    ("Version", FieldKind::Scalar, set_version),
    ("License", FieldKind::Scalar, set_license),
    ("Licence", FieldKind::Scalar, set_license),
    ("OS_type", FieldKind::Scalar, set_os_type),
    ("NeedsCompilation", FieldKind::Scalar, set_needs_compilation),
    ("Depends", FieldKind::List, add_depends),
    ("Imports", FieldKind::List, add_imports),
    ("Suggests", FieldKind::List, add_suggests),
    ("LinkingTo", FieldKind::List, add_linking_to),
    ("Enhances", FieldKind::List, add_enhances),
];

fn scalar(value: FieldValue<'_>) -> &str {
    match value {
        FieldValue::Scalar(s) => s,
        FieldValue::List(items) => items.first().copied().unwrap_or_default(),
    }
}

fn set_name(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    description.name = scalar(value).to_string();
    Ok(())
}

fn set_version(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    description.version = Some(Version::parse(scalar(value))?);
    Ok(())
}

fn set_os_type(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    description.os_type = Some(scalar(value).to_string());
    Ok(())
}

fn set_needs_compilation(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    description.needs_compilation = scalar(value).eq_ignore_ascii_case("yes");
    Ok(())
}

fn add_depends(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    add_dependencies(description, DependencyType::Depends, value)
}

fn add_imports(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    add_dependencies(description, DependencyType::Imports, value)
}

fn add_suggests(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    add_dependencies(description, DependencyType::Suggests, value)
}

fn add_linking_to(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    add_dependencies(description, DependencyType::LinkingTo, value)
}

fn add_enhances(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    add_dependencies(description, DependencyType::Enhances, value)
}

fn set_license(description: &mut PackageDescription, value: FieldValue<'_>) -> Result<()> {
    description.license = Some(scalar(value).to_string());
    Ok(())
}

fn add_dependencies(
    description: &mut PackageDescription,
    kind: DependencyType,
    value: FieldValue<'_>,
) -> Result<()> {
    let FieldValue::List(items) = value else {
        return Ok(());
    };

    for item in items {
        let dependency = DependencyInfo::parse(item)?;
        if kind == DependencyType::Depends && dependency.name == RUNTIME_PACKAGE {
            description.runtime_constraint = dependency.constraint;
            continue;
        }
        description
            .dependencies
            .entry(kind)
            .or_default()
            .push(dependency);
    }
    Ok(())
}

impl PackageDescription {
    pub fn from_record(record: &ControlRecord) -> Result<Self> {
        let mut description = PackageDescription::default();

        for (tag, value) in record.fields() {
            let Some((_, kind, setter)) = DESCRIPTION_FIELDS.iter().find(|(t, ..)| *t == tag)
            else {
                continue;
            };
            let value = match kind {
                FieldKind::Scalar => FieldValue::Scalar(value),
                FieldKind::List => FieldValue::List(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect(),
                ),
            };
            setter(&mut description, value)
                .map_err(|e| Error::resolving(record.get("Package").unwrap_or(tag), e))?;
        }

        if description.name.is_empty() {
            return Err(Error::resolving("<unknown>", "control record without Package"));
        }
        Ok(description)
    }

    /// Parses the first record of a `DESCRIPTION` file.
    pub fn parse(text: &str) -> Result<Self> {
        let record = ControlFileReader::new(text.as_bytes())
            .next()
            .transpose()
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| Error::resolving("<unknown>", "empty DESCRIPTION"))?;
        Self::from_record(&record)
    }

    pub fn dependencies_of(&self, kinds: &[DependencyType]) -> Vec<&DependencyInfo> {
        kinds
            .iter()
            .filter_map(|kind| self.dependencies.get(kind))
            .flatten()
            .collect()
    }
}
