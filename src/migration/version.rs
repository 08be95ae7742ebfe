//! Migration versions and targets

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Dotted version of a versioned migration (`1`, `3.0`, `12.1.4`)
///
/// Segments compare numerically from left to right. A missing trailing segment counts
/// as `0`, so `1`, `1.0` and `1.0.0` are the same version. The textual form keeps the
/// segment count it was parsed with (minus leading zeros), which makes `Display` the
/// canonical form.
#[derive(Debug, Clone)]
pub struct MigrationVersion {
    segments: Vec<u64>,
}

/// Error produced when a string is not a valid version
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

impl MigrationVersion {
    /// Parse a version, accepting `.` and `_` (single or double) as segment separators
    ///
    /// # Errors
    ///
    /// Returns `VersionParseError` for empty input, empty segments or non-numeric
    /// segments.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let fail = |reason: &str| VersionParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(fail("version is empty"));
        }

        let normalized = trimmed.replace("__", ".").replace('_', ".");
        let mut segments = Vec::new();
        for part in normalized.split('.') {
            if part.is_empty() {
                return Err(fail("empty version segment"));
            }
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail("segments must be non-negative integers"));
            }
            let value = part
                .parse::<u64>()
                .map_err(|_| fail("segment is too large"))?;
            segments.push(value);
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Segments without trailing zeros; the basis for equality and hashing
    fn significant(&self) -> &[u64] {
        let len = self
            .segments
            .iter()
            .rposition(|&s| s != 0)
            .map_or(0, |i| i + 1);
        &self.segments[..len]
    }
}

impl FromStr for MigrationVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let left = self.segments.get(i).copied().unwrap_or(0);
            let right = other.segments.get(i).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

/// Upper bound for a migrate run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetVersion {
    /// No ceiling: every resolved migration is eligible
    #[default]
    Latest,
    /// Migrations above this version are held back as `FUTURE`
    Version(MigrationVersion),
}

impl TargetVersion {
    /// Whether `version` lies above the target
    pub fn excludes(&self, version: &MigrationVersion) -> bool {
        match self {
            TargetVersion::Latest => false,
            TargetVersion::Version(target) => version > target,
        }
    }
}

impl FromStr for TargetVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("latest") {
            Ok(TargetVersion::Latest)
        } else {
            MigrationVersion::parse(s).map(TargetVersion::Version)
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetVersion::Latest => f.write_str("latest"),
            TargetVersion::Version(v) => write!(f, "{v}"),
        }
    }
}
