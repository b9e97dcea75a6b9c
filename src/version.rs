//! Java release numbers, class file major versions and the target policy.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::feature::{FeatureFinding, FeatureKind};

/// Oldest major version the reader accepts (JDK 1.0.2 / 1.1).
pub const MIN_MAJOR_VERSION: u16 = 45;
/// Newest major version the reader accepts (Java 25).
pub const MAX_MAJOR_VERSION: u16 = 69;

/// A class file major version, displayed as the matching Java release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JavaVersion(u16);

impl JavaVersion {
    pub const JAVA_8: JavaVersion = JavaVersion(52);
    pub const JAVA_9: JavaVersion = JavaVersion(53);
    pub const JAVA_10: JavaVersion = JavaVersion(54);
    pub const JAVA_11: JavaVersion = JavaVersion(55);
    pub const JAVA_15: JavaVersion = JavaVersion(59);
    pub const JAVA_16: JavaVersion = JavaVersion(60);
    pub const JAVA_17: JavaVersion = JavaVersion(61);
    pub const JAVA_21: JavaVersion = JavaVersion(65);
    pub const LATEST: JavaVersion = JavaVersion(MAX_MAJOR_VERSION);

    pub fn from_major(major: u16) -> Option<Self> {
        (MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION)
            .contains(&major)
            .then_some(JavaVersion(major))
    }

    /// `8` → major 52. Releases 1 through 4 all map onto their historical majors.
    pub fn from_release(release: u16) -> Option<Self> {
        match release {
            0 => None,
            1 => Some(JavaVersion(45)),
            r => Self::from_major(r.checked_add(44)?),
        }
    }

    pub fn major(self) -> u16 {
        self.0
    }

    pub fn release(self) -> u16 {
        self.0.saturating_sub(44).max(1)
    }
}

impl fmt::Display for JavaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Java {}", self.release())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised Java version {input:?} (expected e.g. 8, 1.8, java11, j17)")]
pub struct ParseVersionError {
    input: String,
}

impl FromStr for JavaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError {
            input: s.to_string(),
        };
        let lowered = s.trim().to_ascii_lowercase();
        let digits = lowered
            .strip_prefix("java")
            .or_else(|| lowered.strip_prefix('j'))
            .unwrap_or(&lowered)
            .trim();
        let digits = digits.strip_prefix("1.").unwrap_or(digits);
        let release: u16 = digits.parse().map_err(|_| err())?;
        JavaVersion::from_release(release).ok_or_else(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("{0} is below the oldest supported target (Java 8)")]
    TargetTooOld(JavaVersion),
}

/// The requested output version and the legality rules derived from it.
///
/// Built once per run and shared read-only between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPolicy {
    target: JavaVersion,
}

impl TargetPolicy {
    pub fn new(target: JavaVersion) -> Result<Self, PolicyError> {
        if target < JavaVersion::JAVA_8 {
            return Err(PolicyError::TargetTooOld(target));
        }
        Ok(Self { target })
    }

    pub fn target(&self) -> JavaVersion {
        self.target
    }

    /// Whether every occurrence of `kind` is loadable at the target.
    ///
    /// Kinds whose requirement depends on the occurrence (API members,
    /// versioned attributes) are judged by their earliest possible version.
    pub fn is_legal(&self, kind: FeatureKind) -> bool {
        self.min_version_requiring(kind) <= self.target
    }

    pub fn min_version_requiring(&self, kind: FeatureKind) -> JavaVersion {
        kind.introduced_in()
    }

    /// Whether this specific occurrence needs lowering.
    pub fn is_violating(&self, finding: &FeatureFinding) -> bool {
        finding.introduced_in > self.target
    }

    pub fn allows(&self, version: JavaVersion) -> bool {
        version <= self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        for (input, major) in [
            ("8", 52),
            ("1.8", 52),
            ("java8", 52),
            ("Java 11", 55),
            ("j17", 61),
            ("21", 65),
        ] {
            assert_eq!(input.parse::<JavaVersion>().unwrap().major(), major, "{input}");
        }
        assert!("java".parse::<JavaVersion>().is_err());
        assert!("99".parse::<JavaVersion>().is_err());
    }

    #[test]
    fn display_uses_release_number() {
        assert_eq!(JavaVersion::JAVA_16.to_string(), "Java 16");
        assert_eq!(JavaVersion::from_major(45).unwrap().release(), 1);
    }

    #[test]
    fn policy_rejects_targets_before_java_8() {
        let java7 = JavaVersion::from_release(7).unwrap();
        assert_eq!(
            TargetPolicy::new(java7),
            Err(PolicyError::TargetTooOld(java7))
        );
    }

    #[test]
    fn legality_follows_introduction_version() {
        let policy = TargetPolicy::new(JavaVersion::JAVA_11).unwrap();
        assert!(policy.is_legal(FeatureKind::NestMates));
        assert!(policy.is_legal(FeatureKind::StringConcat));
        assert!(!policy.is_legal(FeatureKind::Record));
        assert_eq!(
            policy.min_version_requiring(FeatureKind::SealedClass),
            JavaVersion::JAVA_17
        );
    }
}
