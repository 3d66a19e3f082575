// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Kubernetes version values.
//!
//! Versions are compared on `(major, minor, patch)`. Input goes through a
//! lenient pass (`v1.15` reads as `1.15.0`) before `semver` parses it.
//! Pre-release and build suffixes (`-rc.1`, `+k3s1`) are accepted and
//! ignored for ordering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when a string is not a usable version.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid version {input:?}: {reason}")]
pub struct VersionError {
    input: String,
    reason: String,
}

impl VersionError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A `MAJOR.MINOR.PATCH` version with total ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

/// Pads a missing minor or patch and strips a leading `v`.
fn lenient(input: &str) -> String {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);

    let mut padded = core.to_string();
    for _ in core.matches('.').count()..2 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    padded
}

impl Version {
    /// Creates a version from its components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a version, tolerating a leading `v` and a missing patch or minor.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        if input.trim().is_empty() {
            return Err(VersionError::new(input, "empty version"));
        }
        semver::Version::parse(&lenient(input))
            .map(Self::from)
            .map_err(|e| VersionError::new(input, e.to_string()))
    }

    /// Returns the next minor version with the patch reset to zero.
    pub fn inc_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, 0)
    }

    /// Returns the previous minor version keeping the patch component.
    pub fn dec_minor(&self) -> Self {
        Self::new(self.major, self.minor.saturating_sub(1), self.patch)
    }

    /// Drops the patch component.
    pub fn truncate(&self) -> Self {
        Self::new(self.major, self.minor, 0)
    }

    /// Formats the version as `MAJOR.MINOR`.
    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

impl From<semver::Version> for Version {
    fn from(v: semver::Version) -> Self {
        Self::new(v.major, v.minor, v.patch)
    }
}

impl From<Version> for semver::Version {
    fn from(v: Version) -> Self {
        semver::Version::new(v.major, v.minor, v.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Reduces a version string to `MAJOR.MINOR`.
pub fn normalize(input: &str) -> Result<String, VersionError> {
    Version::parse(input).map(|v| v.major_minor())
}

/// Returns the smallest and largest versions of a non-empty collection.
pub fn min_max<I>(versions: I) -> Option<(Version, Version)>
where
    I: IntoIterator<Item = Version>,
{
    versions.into_iter().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
