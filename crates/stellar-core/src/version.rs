//! Protocol version negotiation
//!
//! Every message carries `{protocol, software}`. Peers are incompatible iff
//! the protocol MAJOR differs; minor/patch features are additive and recorded
//! per peer so optional fields can be skipped for older peers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Software name advertised in version info.
pub const SOFTWARE_NAME: &str = "stellard";

/// Parsed `MAJOR.MINOR.PATCH` protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// The version this build speaks.
    pub fn current() -> Self {
        PROTOCOL_VERSION.parse().expect("built-in version string")
    }

    /// Compatibility is decided by the major component alone.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = |what: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::InvalidMessage(format!("version missing {what}")))?
                .parse()
                .map_err(|_| Error::InvalidMessage(format!("version {what} not a number in {s:?}")))
        };
        let version = Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        };
        if parts.next().is_some() {
            return Err(Error::InvalidMessage(format!(
                "version {s:?} has trailing components"
            )));
        }
        Ok(version)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Wire form of the version stamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub protocol: String,
    pub software: String,
}

impl VersionInfo {
    /// Version info for this build.
    pub fn current() -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            software: SOFTWARE_NAME.to_string(),
        }
    }

    /// Parse the protocol component.
    pub fn parse_protocol(&self) -> Result<ProtocolVersion> {
        self.protocol.parse()
    }

    /// Reject peers whose protocol major differs from ours.
    pub fn check_compatible(&self) -> Result<ProtocolVersion> {
        let ours = ProtocolVersion::current();
        let theirs = self.parse_protocol()?;
        if !ours.is_compatible_with(&theirs) {
            return Err(Error::IncompatibleVersion {
                ours: ours.to_string(),
                theirs: theirs.to_string(),
            });
        }
        Ok(theirs)
    }
}
