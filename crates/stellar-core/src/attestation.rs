//! Attestations: signed proof of one RPC hop
//!
//! The signing input is canonical JSON with exactly the keys
//! `{"from","to","timestamp","type"}` in that order, no whitespace, decimal
//! timestamp, lowercase hyphenated UUIDs. Implementations in other languages
//! MUST produce identical bytes.

use crate::encoding;
use crate::error::{Error, Result};
use crate::identity::KeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default accepted clock drift, seconds.
pub const DEFAULT_DRIFT_SECS: u64 = 300;

/// The six attested message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    PingResponse,
    FindNode,
    FindNodeResponse,
    Announce,
    AnnounceResponse,
}

impl MessageType {
    /// Canonical wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::PingResponse => "ping_response",
            MessageType::FindNode => "find_node",
            MessageType::FindNodeResponse => "find_node_response",
            MessageType::Announce => "announce",
            MessageType::AnnounceResponse => "announce_response",
        }
    }

    /// The response type paired with a request type (identity for responses).
    pub fn response(&self) -> MessageType {
        match self {
            MessageType::Ping => MessageType::PingResponse,
            MessageType::FindNode => MessageType::FindNodeResponse,
            MessageType::Announce => MessageType::AnnounceResponse,
            other => *other,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::PingResponse
                | MessageType::FindNodeResponse
                | MessageType::AnnounceResponse
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed record of one RPC hop.
///
/// Created by the sender, stored by the receiver, immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub from: Uuid,
    /// Nil UUID for first-contact messages with no known recipient.
    pub to: Uuid,
    pub timestamp: u64,
    pub message_type: MessageType,
    #[serde(with = "encoding::b64")]
    pub signature: Vec<u8>,
    #[serde(with = "encoding::b64")]
    pub public_key: Vec<u8>,
}

/// Canonical signing shape. Field order here IS the wire key order.
#[derive(Serialize)]
struct SignableAttestation<'a> {
    from: String,
    to: String,
    timestamp: u64,
    #[serde(rename = "type")]
    message_type: &'a str,
}

/// Build the canonical signing bytes for an attestation tuple. Pure.
pub fn signable_message(from: &Uuid, to: &Uuid, timestamp: u64, message_type: MessageType) -> Vec<u8> {
    let canonical = SignableAttestation {
        from: from.hyphenated().to_string(),
        to: to.hyphenated().to_string(),
        timestamp,
        message_type: message_type.as_str(),
    };
    // Struct serialization with fixed field order cannot fail.
    serde_json::to_vec(&canonical).expect("canonical attestation shape")
}

impl Attestation {
    /// Sign a new attestation with the local keypair.
    pub fn sign(
        from: Uuid,
        to: Uuid,
        message_type: MessageType,
        timestamp: u64,
        keypair: &KeyPair,
    ) -> Self {
        let message = signable_message(&from, &to, timestamp, message_type);
        Self {
            from,
            to,
            timestamp,
            message_type,
            signature: keypair.sign(&message).to_vec(),
            public_key: keypair.public_key().to_vec(),
        }
    }

    /// The canonical bytes this attestation signs.
    pub fn signable_message(&self) -> Vec<u8> {
        signable_message(&self.from, &self.to, self.timestamp, self.message_type)
    }

    /// Verify the embedded Ed25519 signature.
    pub fn verify(&self) -> Result<()> {
        KeyPair::verify(&self.public_key, &self.signable_message(), &self.signature)
    }

    /// `|now − timestamp| ≤ drift`.
    pub fn is_timestamp_valid(&self, now: u64, drift_secs: u64) -> bool {
        now.abs_diff(self.timestamp) <= drift_secs
    }

    /// True when addressed to `recipient` or to nobody (first contact).
    pub fn accepts_recipient(&self, recipient: &Uuid) -> bool {
        self.to == *recipient || self.to.is_nil()
    }

    /// Idempotence key over the full 6-tuple.
    pub fn tuple_key(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.signable_message());
        hasher.update(&self.signature);
        hasher.update(&self.public_key);
        hasher.finalize().into()
    }
}

/// Check an inbound attestation against the envelope sender and ourselves.
pub fn validate_inbound(
    attestation: &Attestation,
    sender: &Uuid,
    recipient: &Uuid,
    now: u64,
    drift_secs: u64,
) -> Result<()> {
    attestation.verify()?;
    if attestation.from != *sender {
        return Err(Error::InvalidAttestation(
            "attestation sender does not match envelope sender".into(),
        ));
    }
    if !attestation.accepts_recipient(recipient) {
        return Err(Error::InvalidAttestation(
            "attestation addressed to another system".into(),
        ));
    }
    if !attestation.is_timestamp_valid(now, drift_secs) {
        return Err(Error::InvalidAttestation(format!(
            "timestamp {} outside drift window",
            attestation.timestamp
        )));
    }
    Ok(())
}
