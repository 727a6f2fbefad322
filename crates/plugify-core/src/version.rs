// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Semantic versions and version constraints
//!
//! [`Version`] is the `(major, minor, patch)` triple plus optional
//! pre-release/build tags used throughout the manifest model. [`Constraint`]
//! pairs a [`Comparison`] with a `Version` and is the unit the resolver
//! (`crate::resolver`) uses to decide whether a dependency is satisfiable.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a [`Version`] or [`Constraint`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,

    #[error("invalid version core '{0}': expected major.minor.patch")]
    InvalidCore(String),

    #[error("invalid numeric component '{0}'")]
    InvalidComponent(String),

    #[error("unknown comparison operator '{0}'")]
    UnknownOperator(String),
}

/// A semver triple with optional pre-release and build metadata.
///
/// Ordering follows SemVer 2.0: numeric comparison on `(major, minor,
/// patch)`, then pre-release precedence (a version with a pre-release tag
/// is lower than the same version without one), build metadata is ignored
/// for ordering and equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch, pre_release: None, build: None }
    }

    pub fn with_pre_release(mut self, pre_release: impl Into<String>) -> Self {
        self.pre_release = Some(pre_release.into());
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// Core triple, ignoring pre-release/build, for quick comparisons.
    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let (core_and_pre, build) = match s.split_once('+') {
            Some((a, b)) => (a, Some(b.to_string())),
            None => (s, None),
        };
        let (core, pre_release) = match core_and_pre.split_once('-') {
            Some((a, b)) => (a, Some(b.to_string())),
            None => (core_and_pre, None),
        };

        let mut parts = core.split('.');
        let major = parts
            .next()
            .ok_or_else(|| VersionParseError::InvalidCore(s.to_string()))?;
        let minor = parts
            .next()
            .ok_or_else(|| VersionParseError::InvalidCore(s.to_string()))?;
        let patch = parts
            .next()
            .ok_or_else(|| VersionParseError::InvalidCore(s.to_string()))?;
        if parts.next().is_some() {
            return Err(VersionParseError::InvalidCore(s.to_string()));
        }

        let parse_component = |c: &str| {
            c.parse::<u64>()
                .map_err(|_| VersionParseError::InvalidComponent(c.to_string()))
        };

        Ok(Version {
            major: parse_component(major)?,
            minor: parse_component(minor)?,
            patch: parse_component(patch)?,
            pre_release,
            build,
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.core() == other.core() && self.pre_release == other.pre_release
    }
}
impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core().cmp(&other.core()).then_with(|| {
            // A pre-release version has lower precedence than the
            // associated normal version (SemVer 2.0 §11).
            match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre_release(a, b),
            }
        })
    }
}

fn compare_pre_release(a: &str, b: &str) -> Ordering {
    let a_ids: Vec<&str> = a.split('.').collect();
    let b_ids: Vec<&str> = b.split('.').collect();
    for pair in a_ids.iter().zip(b_ids.iter()) {
        let (x, y) = pair;
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(xn), Ok(yn)) => xn.cmp(&yn),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a_ids.len().cmp(&b_ids.len())
}

/// Comparison operator used by a [`Constraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Any,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// `~> v`: semver-compatible range, see [`Constraint::satisfies`].
    Compatible,
}

impl Comparison {
    fn as_str(self) -> &'static str {
        match self {
            Comparison::Any => "",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Compatible => "~>",
        }
    }
}

/// A version constraint: `(comparison, version)`.
///
/// An empty constraint list (`Constraint::any()`, or the empty string when
/// parsed from text) means "any version satisfies this dependency".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub comparison: Comparison,
    pub version: Version,
}

impl Constraint {
    pub fn any() -> Self {
        Self { comparison: Comparison::Any, version: Version::default() }
    }

    /// Whether `candidate` satisfies this constraint.
    ///
    /// `Compatible` follows the SemVer-standard upper bound, not the
    /// original C++ implementation's exact-match shortcut on
    /// `major`/`minor` — see DESIGN.md's Open Question resolution for
    /// why this is a deliberate redesign rather than a faithful port.
    pub fn satisfies(&self, candidate: &Version) -> bool {
        match self.comparison {
            Comparison::Any => true,
            Comparison::Eq => candidate == &self.version,
            Comparison::Ne => candidate != &self.version,
            Comparison::Gt => candidate > &self.version,
            Comparison::Ge => candidate >= &self.version,
            Comparison::Lt => candidate < &self.version,
            Comparison::Le => candidate <= &self.version,
            Comparison::Compatible => self.satisfies_compatible(candidate),
        }
    }

    fn satisfies_compatible(&self, candidate: &Version) -> bool {
        let v = &self.version;
        if candidate < v {
            return false;
        }
        if v.major > 0 {
            candidate.major == v.major
        } else if v.minor > 0 {
            candidate.major == 0 && candidate.minor == v.minor
        } else {
            candidate.major == 0 && candidate.minor == 0 && candidate.patch == v.patch
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparison.as_str(), self.version)
    }
}

impl FromStr for Constraint {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Constraint::any());
        }
        for (op_str, comparison) in [
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            ("~>", Comparison::Compatible),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
        ] {
            if let Some(rest) = s.strip_prefix(op_str) {
                let version = rest.parse::<Version>()?;
                return Ok(Constraint { comparison, version });
            }
        }
        Err(VersionParseError::UnknownOperator(s.to_string()))
    }
}
