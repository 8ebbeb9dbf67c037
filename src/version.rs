// src/version.rs

//! Module version handling
//!
//! Module versions are accepted in a relaxed form (`1.0`, `1.0-SNAPSHOT`,
//! `2.1.3.rc1`) and normalized to the registry form
//! `major.minor.micro[.qualifier]`. Two versions are equal when their
//! normalized forms are equal, so `1.0` and `1.0.0` name the same module.

use crate::error::{Error, Result};
use std::fmt;

/// Marker that flags a development version eligible for in-place updates
const SNAPSHOT_MARKER: &str = "SNAPSHOT";

/// A normalized module version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleVersion {
    core: semver::Version,
    qualifier: String,
}

impl ModuleVersion {
    /// Parse a version in relaxed syntax
    ///
    /// Up to three leading numeric components are taken as the numeric core
    /// (missing components default to zero); whatever follows, minus a
    /// leading `.`, `-` or `_`, becomes the qualifier. Characters outside
    /// `[A-Za-z0-9_-]` in the qualifier are replaced with `_`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidVersion(input.to_string()));
        }

        let mut numbers: Vec<u64> = Vec::with_capacity(3);
        let mut rest = trimmed;

        while numbers.len() < 3 {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                break;
            }
            let n = rest[..digits]
                .parse::<u64>()
                .map_err(|_| Error::InvalidVersion(input.to_string()))?;
            numbers.push(n);
            rest = &rest[digits..];

            let continues = rest.starts_with('.')
                && rest[1..].bytes().next().is_some_and(|b| b.is_ascii_digit());
            if continues && numbers.len() < 3 {
                rest = &rest[1..];
            } else {
                break;
            }
        }

        let qualifier: String = rest
            .trim_start_matches(['.', '-', '_'])
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let component = |i: usize| numbers.get(i).copied().unwrap_or(0);

        Ok(Self {
            core: semver::Version::new(component(0), component(1), component(2)),
            qualifier,
        })
    }

    pub fn major(&self) -> u64 {
        self.core.major
    }

    pub fn minor(&self) -> u64 {
        self.core.minor
    }

    pub fn micro(&self) -> u64 {
        self.core.patch
    }

    pub fn qualifier(&self) -> Option<&str> {
        if self.qualifier.is_empty() {
            None
        } else {
            Some(&self.qualifier)
        }
    }

    /// Whether this version denotes an in-development build
    pub fn is_snapshot(&self) -> bool {
        self.qualifier.to_ascii_uppercase().contains(SNAPSHOT_MARKER)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.core.major, self.core.minor, self.core.patch)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ModuleVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compare two supplied version strings for equality in normalized form
///
/// Unparseable strings are only equal to themselves.
pub fn equal_as_module_versions(a: &str, b: &str) -> bool {
    match (ModuleVersion::parse(a), ModuleVersion::parse(b)) {
        (Ok(va), Ok(vb)) => va == vb,
        _ => a.trim() == b.trim(),
    }
}

/// A symbolic name paired with a normalized version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionedName {
    pub name: String,
    pub version: ModuleVersion,
}

impl VersionedName {
    pub fn new(name: impl Into<String>, version: ModuleVersion) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse both parts from supplied strings
    pub fn parse(name: &str, version: &str) -> Result<Self> {
        Ok(Self::new(name.trim(), ModuleVersion::parse(version)?))
    }
}

impl fmt::Display for VersionedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_short_versions() {
        assert_eq!(ModuleVersion::parse("1").unwrap().to_string(), "1.0.0");
        assert_eq!(ModuleVersion::parse("1.2").unwrap().to_string(), "1.2.0");
        assert_eq!(ModuleVersion::parse("1.2.3").unwrap().to_string(), "1.2.3");
    }

    #[test]
    fn test_qualifier_separators() {
        let v = ModuleVersion::parse("1.0-SNAPSHOT").unwrap();
        assert_eq!(v.to_string(), "1.0.0.SNAPSHOT");
        assert_eq!(v.qualifier(), Some("SNAPSHOT"));

        let w = ModuleVersion::parse("1.0.0.SNAPSHOT").unwrap();
        assert_eq!(v, w);

        let x = ModuleVersion::parse("2.1.3.4").unwrap();
        assert_eq!(x.to_string(), "2.1.3.4");
    }

    #[test]
    fn test_non_numeric_version_keeps_text_as_qualifier() {
        let v = ModuleVersion::parse("beta+1").unwrap();
        assert_eq!(v.to_string(), "0.0.0.beta_1");
    }

    #[test]
    fn test_empty_version_is_invalid() {
        assert!(matches!(
            ModuleVersion::parse("  "),
            Err(Error::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_equality_ignores_padding() {
        assert!(equal_as_module_versions("1.0", "1.0.0"));
        assert!(equal_as_module_versions("1.0-SNAPSHOT", "1.0.0.SNAPSHOT"));
        assert!(!equal_as_module_versions("1.0", "1.0.1"));
        assert!(!equal_as_module_versions("1.0", "1.0-SNAPSHOT"));
    }

    #[test]
    fn test_snapshot_detection() {
        assert!(ModuleVersion::parse("1.0.0.snapshot").unwrap().is_snapshot());
        assert!(!ModuleVersion::parse("1.0.0").unwrap().is_snapshot());
        assert!(ModuleVersion::parse("3.0-SNAPSHOT").unwrap().is_snapshot());
    }

    #[test]
    fn test_ordering() {
        let a = ModuleVersion::parse("1.0").unwrap();
        let b = ModuleVersion::parse("1.0.0.rc1").unwrap();
        let c = ModuleVersion::parse("1.1").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_versioned_name_display() {
        let vn = VersionedName::parse("acme.core", "1.0-SNAPSHOT").unwrap();
        assert_eq!(vn.to_string(), "acme.core:1.0.0.SNAPSHOT");
    }
}
