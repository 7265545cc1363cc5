//! Core identifier and version types
//!
//! ## Table of Contents
//! - **RunName**: Hierarchical, path-like run identifier
//! - **SpecId**: Stable building spec identifier (row key)
//! - **SemVer**: `major.minor.patch` experiment version
//! - **VersionBump**: Which component a publish increments

use crate::error::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hierarchical run identifier such as `lisbon/baseline`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunName(String);

impl RunName {
    /// Parse and normalise a run name
    ///
    /// Leading/trailing slashes are stripped; empty segments, `.`/`..`
    /// segments and whitespace are rejected so the name is safe to use as a
    /// storage prefix and a local directory.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim_matches('/');
        if trimmed.is_empty() {
            return Err(FanoutError::config("run name must not be empty"));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(FanoutError::config(format!(
                    "invalid run name segment in '{}'",
                    name
                )));
            }
            if segment.chars().any(char::is_whitespace) {
                return Err(FanoutError::config(format!(
                    "run name '{}' contains whitespace",
                    name
                )));
            }
            // reserved for storage layout: `_partials`, `v1.0.0`
            if segment.starts_with('_') || is_version_segment(segment) {
                return Err(FanoutError::config(format!(
                    "run name '{}' uses reserved segment '{}'",
                    name, segment
                )));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the run name
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunName {
    type Error = FanoutError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RunName> for String {
    fn from(name: RunName) -> Self {
        name.0
    }
}

impl FromStr for RunName {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Stable identifier of one building spec; the row key of every dataframe
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecId(String);

impl SpecId {
    /// Create a spec id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SpecId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Semantic version of a published experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemVer {
    /// Major component
    pub major: u32,
    /// Minor component
    pub minor: u32,
    /// Patch component
    pub patch: u32,
}

impl SemVer {
    /// The version assigned to the first publish of a run
    pub const INITIAL: SemVer = SemVer::new(1, 0, 0);

    /// Create a version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Apply a bump
    pub fn bump(self, bump: VersionBump) -> Self {
        match bump {
            VersionBump::Major => Self::new(self.major + 1, 0, 0),
            VersionBump::Minor => Self::new(self.major, self.minor + 1, 0),
            VersionBump::Patch => Self::new(self.major, self.minor, self.patch + 1),
        }
    }

    /// Storage path segment, e.g. `v1.2.0`
    pub fn path_segment(&self) -> String {
        format!("v{}", self)
    }

    /// Parse a storage path segment; requires the `v` prefix
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        let raw = segment.strip_prefix('v')?;
        if !raw.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        raw.parse().ok()
    }
}

fn is_version_segment(segment: &str) -> bool {
    SemVer::from_path_segment(segment).is_some()
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = FanoutError;

    /// Accepts `1.2.3` and `v1.2.3`
    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(FanoutError::config(format!("invalid version '{}'", s)));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| FanoutError::config(format!("invalid version '{}'", s)))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// Version component incremented by a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    /// Breaking change, external policy decision
    Major,
    /// Default for every new submission under an existing run name
    #[default]
    Minor,
    /// Corrective republish, external policy decision
    Patch,
}
