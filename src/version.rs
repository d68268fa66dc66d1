//! Package versions and version constraints.
//!
//! A version string such as `1.2-3` is split on `.` and `-` into at most
//! [`MAX_SUBDIVISIONS`] numeric fields. Each field occupies 32 bits of one
//! packed integer, most significant field first, so comparing versions is a
//! plain integer comparison.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum number of subdivisions a version can have.
pub const MAX_SUBDIVISIONS: usize = 5;

/// Packed numeric value of a version.
///
/// The fields are stored most significant first; the derived ordering of the
/// array is the ordering of the packed 160-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct VersionNumber([u32; MAX_SUBDIVISIONS]);

impl VersionNumber {
    pub const MIN: VersionNumber = VersionNumber([0; MAX_SUBDIVISIONS]);
    pub const MAX: VersionNumber = VersionNumber([u32::MAX; MAX_SUBDIVISIONS]);

    pub fn new(fields: [u32; MAX_SUBDIVISIONS]) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[u32; MAX_SUBDIVISIONS] {
        &self.0
    }

    /// Encodes a version string.
    pub fn encode(version: &str) -> Result<Self> {
        let version = version.trim();
        if version.is_empty() {
            return Err(Error::VersionFormat(version.to_string()));
        }

        let parts: Vec<&str> = version.split(['.', '-']).collect();
        if parts.len() > MAX_SUBDIVISIONS {
            return Err(Error::VersionFormat(version.to_string()));
        }

        let mut fields = [0u32; MAX_SUBDIVISIONS];
        for (field, part) in fields.iter_mut().zip(parts) {
            *field = part
                .parse()
                .map_err(|_| Error::VersionFormat(version.to_string()))?;
        }
        Ok(Self(fields))
    }

    /// Decodes into the canonical form, always five dot separated fields.
    pub fn decode(&self) -> String {
        self.0
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// The packed integer, big-endian.
    pub fn to_be_bytes(&self) -> [u8; 4 * MAX_SUBDIVISIONS] {
        let mut bytes = [0u8; 4 * MAX_SUBDIVISIONS];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        bytes
    }

    pub fn from_be_bytes(bytes: [u8; 4 * MAX_SUBDIVISIONS]) -> Self {
        let mut fields = [0u32; MAX_SUBDIVISIONS];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
            *field = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(fields)
    }

    /// The packed integer plus one. Saturates at [`VersionNumber::MAX`].
    pub fn successor(&self) -> Self {
        if *self == Self::MAX {
            return *self;
        }
        let mut fields = self.0;
        for field in fields.iter_mut().rev() {
            let (next, carry) = field.overflowing_add(1);
            *field = next;
            if !carry {
                break;
            }
        }
        Self(fields)
    }

    /// Treats a plain integer (a checkout revision) as the packed value.
    pub fn from_integer(value: u64) -> Self {
        let mut fields = [0u32; MAX_SUBDIVISIONS];
        fields[MAX_SUBDIVISIONS - 1] = value as u32;
        fields[MAX_SUBDIVISIONS - 2] = (value >> 32) as u32;
        Self(fields)
    }

    /// The packed value as a plain integer, if it fits.
    pub fn to_integer(&self) -> Option<u64> {
        if self.0[..MAX_SUBDIVISIONS - 2].iter().any(|f| *f != 0) {
            return None;
        }
        Some(
            (u64::from(self.0[MAX_SUBDIVISIONS - 2]) << 32)
                | u64::from(self.0[MAX_SUBDIVISIONS - 1]),
        )
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.decode())
    }
}

/// A version as written by its author plus its packed value.
///
/// Equality and ordering only look at the packed value: `1.2.3` and `1-2.3`
/// are the same version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    text: Option<String>,
    number: VersionNumber,
}

impl Version {
    pub fn parse(text: &str) -> Result<Self> {
        let number = VersionNumber::encode(text)?;
        Ok(Self {
            text: Some(text.trim().to_string()),
            number,
        })
    }

    pub fn from_number(number: VersionNumber) -> Self {
        Self { text: None, number }
    }

    /// Version of a checkout at the given revision.
    pub fn from_revision(revision: u64) -> Self {
        Self::from_number(VersionNumber::from_integer(revision))
    }

    pub fn number(&self) -> VersionNumber {
        self.number
    }

    /// The checkout revision this version stands for, if any. A version
    /// written as a plain integer counts as a revision.
    pub fn revision(&self) -> Option<u64> {
        self.number
            .to_integer()
            .or_else(|| self.text.as_deref()?.parse().ok())
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => f.write_str(text),
            None => write!(f, "{}", self.number),
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.number.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number)
    }
}

static CONSTRAINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([<>=]*)\s*([0-9.\-]+)").expect("constraint pattern is valid")
});

/// Half-open range `[min, max)` of accepted versions. Missing bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub min: Option<VersionNumber>,
    pub max: Option<VersionNumber>,
}

impl VersionConstraint {
    /// Parses constraints like `>= 2.10` or `= 1.0, < 2`.
    ///
    /// Returns `None` when no bound could be read.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let mut constraint = VersionConstraint::default();

        for captures in CONSTRAINT_PATTERN.captures_iter(text) {
            let operator = captures.get(1).map_or("", |m| m.as_str());
            let number = VersionNumber::encode(&captures[2])?;

            match operator {
                "=" | "==" => {
                    constraint.min = Some(number);
                    constraint.max = Some(number.successor());
                }
                ">" => constraint.min = Some(number.successor()),
                ">=" => constraint.min = Some(number),
                "<" => constraint.max = Some(number),
                "<=" => constraint.max = Some(number.successor()),
                _ => {}
            }
        }

        if constraint.min.is_none() && constraint.max.is_none() {
            return Ok(None);
        }
        Ok(Some(constraint))
    }

    pub fn contains(&self, version: VersionNumber) -> bool {
        self.min.is_none_or(|min| version >= min) && self.max.is_none_or(|max| version < max)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, ">= {min}, < {max}"),
            (Some(min), None) => write!(f, ">= {min}"),
            (None, Some(max)) => write!(f, "< {max}"),
            (None, None) => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(text: &str) -> VersionNumber {
        VersionNumber::encode(text).unwrap()
    }

    #[test]
    fn test_separators_are_interchangeable() {
        assert_eq!(number("1.2.3"), number("1-2.3"));
        assert_eq!(Version::parse("1.2.3").unwrap(), Version::parse("1-2-3").unwrap());
    }

    #[test]
    fn test_ordering_by_packed_value() {
        assert!(number("1.2.4") > number("1-2-3.4"));
        assert!(number("1-2-3.4") < number("1-2-3.8"));
        assert!(number("2") > number("1.99999"));
        assert!(number("0.10") > number("0.9"));
    }

    #[test]
    fn test_decode_emits_five_fields() {
        assert_eq!(number("1.2-3").decode(), "1.2.3.0.0");
        assert_eq!(number(&number("4.0.1").decode()), number("4.0.1"));
    }

    #[test]
    fn test_packed_bytes_round_trip() {
        let value = number("3.0.2.7.4294967295");
        assert_eq!(VersionNumber::from_be_bytes(value.to_be_bytes()), value);
        assert_eq!(value.to_be_bytes()[0..4], [0, 0, 0, 3]);
    }

    #[test]
    fn test_invalid_versions() {
        assert!(matches!(
            VersionNumber::encode("1.2.3.4.5.6"),
            Err(Error::VersionFormat(_))
        ));
        assert!(VersionNumber::encode("1.a").is_err());
        assert!(VersionNumber::encode("").is_err());
        assert!(VersionNumber::encode("1..2").is_err());
    }

    #[test]
    fn test_successor_carries() {
        let value = VersionNumber::new([1, 0, 0, 0, u32::MAX]);
        assert_eq!(value.successor(), VersionNumber::new([1, 0, 0, 1, 0]));
        assert_eq!(VersionNumber::MAX.successor(), VersionNumber::MAX);
    }

    #[test]
    fn test_revision_versions() {
        let version = Version::from_revision(1234);
        assert_eq!(version.revision(), Some(1234));
        assert!(Version::from_revision(1235) > version);
        assert_eq!(version.to_string(), "0.0.0.0.1234");
        assert_eq!(Version::parse("1.0").unwrap().revision(), None);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let version = Version::parse("1.0-2").unwrap();
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"1.0-2\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
        assert!(serde_json::from_str::<Version>("\"x\"").is_err());
    }

    #[test]
    fn test_constraint_operators() {
        let eq = VersionConstraint::parse("= 1.0").unwrap().unwrap();
        assert!(eq.contains(number("1.0")));
        assert!(!eq.contains(number("1.0.0.0.1")));

        let gt = VersionConstraint::parse("> 1.0").unwrap().unwrap();
        assert!(!gt.contains(number("1.0")));
        assert!(gt.contains(number("1.0.0.0.1")));

        let ge = VersionConstraint::parse(">= 2.10").unwrap().unwrap();
        assert!(ge.contains(number("2.10")));
        assert!(!ge.contains(number("2.9")));

        let lt = VersionConstraint::parse("< 3").unwrap().unwrap();
        assert!(!lt.contains(number("3")));

        let le = VersionConstraint::parse("<= 3").unwrap().unwrap();
        assert!(le.contains(number("3")));
        assert!(!le.contains(number("3.0.0.0.1")));
    }

    #[test]
    fn test_constraint_combines_bounds() {
        let range = VersionConstraint::parse(">= 1.2, < 2").unwrap().unwrap();
        assert_eq!(range.min, Some(number("1.2")));
        assert_eq!(range.max, Some(number("2")));
    }

    #[test]
    fn test_constraint_without_bounds() {
        assert_eq!(VersionConstraint::parse("").unwrap(), None);
        assert_eq!(VersionConstraint::parse("any").unwrap(), None);
    }
}
