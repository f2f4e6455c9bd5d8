//! Error taxonomy for Stellar Lab
//!
//! The RPC layer maps each variant onto an HTTP status; client-caused faults
//! are distinguished from internal ones so handlers can pick the log level.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stellar Lab error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed envelope or field
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Required attestation absent
    #[error("missing attestation")]
    MissingAttestation,

    /// Signature, timestamp, or sender/recipient mismatch
    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),

    /// Protocol major differs
    #[error("incompatible version: ours {ours}, theirs {theirs}")]
    IncompatibleVersion { ours: String, theirs: String },

    /// Stored identity binding contradicts the claimed public key
    #[error("identity conflict for {uuid}")]
    IdentityConflict { uuid: String },

    /// Claimed coordinates deviate from the sponsor-derived expectation
    #[error("coordinate conflict: deviation {deviation:.3}")]
    CoordinateConflict { deviation: f64 },

    /// Routing table at class-determined maximum
    #[error("at capacity ({capacity} peers)")]
    AtCapacity { capacity: usize },

    /// Unknown RPC type or endpoint
    #[error("not found: {0}")]
    NotFound(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Key persistence failed
    #[error("key persistence failed: {0}")]
    KeyPersist(String),

    /// Iterative lookup made no progress in the first round
    #[error("lookup timed out before the shortlist filled")]
    LookupTimeout,

    /// Storage or other unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the RPC layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidMessage(_) => 400,
            Error::MissingAttestation => 401,
            Error::InvalidAttestation(_) => 402,
            Error::IncompatibleVersion { .. } => 403,
            Error::NotFound(_) => 404,
            Error::IdentityConflict { .. } => 409,
            Error::CoordinateConflict { .. } => 409,
            Error::AtCapacity { .. } => 429,
            _ => 500,
        }
    }

    /// True for faults caused by the remote caller.
    ///
    /// These are reported to the peer but not logged at error level.
    pub fn is_client_fault(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::InvalidMessage("x".into()).status_code(), 400);
        assert_eq!(Error::MissingAttestation.status_code(), 401);
        assert_eq!(Error::InvalidAttestation("bad sig".into()).status_code(), 402);
        assert_eq!(
            Error::IncompatibleVersion {
                ours: "1.0.0".into(),
                theirs: "2.0.0".into()
            }
            .status_code(),
            403
        );
        assert_eq!(Error::IdentityConflict { uuid: "u".into() }.status_code(), 409);
        assert_eq!(Error::CoordinateConflict { deviation: 9.0 }.status_code(), 409);
        assert_eq!(Error::AtCapacity { capacity: 10 }.status_code(), 429);
        assert_eq!(Error::NotFound("rpc".into()).status_code(), 404);
        assert_eq!(Error::Internal("db".into()).status_code(), 500);
    }

    #[test]
    fn test_client_fault_split() {
        assert!(Error::MissingAttestation.is_client_fault());
        assert!(Error::AtCapacity { capacity: 10 }.is_client_fault());
        assert!(!Error::Internal("db".into()).is_client_fault());
        assert!(!Error::KeyGen("rng".into()).is_client_fault());
    }
}
