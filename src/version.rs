//! Factorio version triples as stored in save headers and reported by `--version`.

use std::fmt;
use std::str::FromStr;

/// A Factorio version, e.g. `2.0.39`.
///
/// Equality is component-wise; a candidate executable matches a save only when
/// all three components are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl GameVersion {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a version string is not of the form `X.Y.Z`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid version string: {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for GameVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| ParseVersionError(s.to_string()))
        };
        let version = GameVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ParseVersionError(s.to_string()));
        }
        Ok(version)
    }
}
