// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool-protocol version negotiation.
//!
//! Every session opens with a handshake: the client offers its version, the
//! endpoint answers with its own, and the effective version is the minimum of
//! the two when the majors agree. Differing majors are incompatible.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The protocol version this client speaks.
pub const PROTOCOL_VERSION: &str = "acp/v1.0";

/// Errors from parsing or negotiating protocol versions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The string does not look like `acp/vMAJOR.MINOR`.
    #[error("invalid version format (expected \"acp/vMAJOR.MINOR\")")]
    InvalidFormat,

    /// The peers' major versions differ.
    #[error("incompatible protocol versions: local {local}, remote {remote}")]
    Incompatible {
        /// Our version.
        local: ProtocolVersion,
        /// The endpoint's version.
        remote: ProtocolVersion,
    },
}

/// A parsed `acp/vMAJOR.MINOR` protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Breaking-change counter.
    pub major: u32,
    /// Additive-change counter.
    pub minor: u32,
}

impl ProtocolVersion {
    /// Parse a version string of the form `acp/vMAJOR.MINOR`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::InvalidFormat`] on malformed input.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let rest = s.strip_prefix("acp/v").ok_or(VersionError::InvalidFormat)?;
        let (major_str, minor_str) = rest.split_once('.').ok_or(VersionError::InvalidFormat)?;
        let major = major_str.parse::<u32>().map_err(|_| VersionError::InvalidFormat)?;
        let minor = minor_str.parse::<u32>().map_err(|_| VersionError::InvalidFormat)?;
        Ok(Self { major, minor })
    }

    /// The version this client was built with.
    ///
    /// # Panics
    ///
    /// Never: [`PROTOCOL_VERSION`] is a compile-time constant in the valid
    /// format.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(PROTOCOL_VERSION).expect("PROTOCOL_VERSION must parse")
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acp/v{}.{}", self.major, self.minor)
    }
}

/// Negotiate the effective version between two peers.
///
/// Returns the minimum of the two when the majors match.
///
/// # Errors
///
/// Returns [`VersionError::Incompatible`] when the majors differ.
pub fn negotiate_version(
    local: ProtocolVersion,
    remote: ProtocolVersion,
) -> Result<ProtocolVersion, VersionError> {
    if local.major != remote.major {
        return Err(VersionError::Incompatible { local, remote });
    }
    Ok(local.min(remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let v = ProtocolVersion::parse("acp/v1.4").unwrap();
        assert_eq!(v, ProtocolVersion { major: 1, minor: 4 });
        assert_eq!(v.to_string(), "acp/v1.4");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["acp/v1", "v1.0", "acp/vx.y", "acp/v1.0.0", ""] {
            assert!(ProtocolVersion::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn current_matches_constant() {
        assert_eq!(ProtocolVersion::current().to_string(), PROTOCOL_VERSION);
    }

    #[test]
    fn negotiation_picks_minimum() {
        let a = ProtocolVersion { major: 1, minor: 0 };
        let b = ProtocolVersion { major: 1, minor: 3 };
        assert_eq!(negotiate_version(a, b).unwrap(), a);
        assert_eq!(negotiate_version(b, a).unwrap(), a);
    }

    #[test]
    fn negotiation_rejects_major_mismatch() {
        let a = ProtocolVersion { major: 1, minor: 0 };
        let b = ProtocolVersion { major: 2, minor: 0 };
        assert!(matches!(
            negotiate_version(a, b),
            Err(VersionError::Incompatible { .. })
        ));
    }
}
