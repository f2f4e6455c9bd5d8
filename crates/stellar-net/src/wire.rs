//! Wire envelopes for the galaxy RPC protocol
//!
//! Every RPC travels as one JSON envelope over `POST /dht`:
//!
//! ```text
//! { type, is_response, request_id, from_system, target_id?, closest_nodes?,
//!   attestation, version }
//! ```
//!
//! Unknown fields are ignored for forward compatibility; the baseline fields
//! above are mandatory in every message.

use serde::{Deserialize, Serialize};
use stellar_core::attestation::{Attestation, MessageType};
use stellar_core::error::{Error, Result};
use stellar_core::types::{NodeId, System};
use stellar_core::version::VersionInfo;
use uuid::Uuid;

/// The three RPC pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcType {
    Ping,
    FindNode,
    Announce,
}

impl RpcType {
    /// Attestation message type carried by this RPC direction.
    pub fn attestation_type(&self, is_response: bool) -> MessageType {
        let request = match self {
            RpcType::Ping => MessageType::Ping,
            RpcType::FindNode => MessageType::FindNode,
            RpcType::Announce => MessageType::Announce,
        };
        if is_response {
            request.response()
        } else {
            request
        }
    }
}

/// One RPC message, request or response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub rpc: RpcType,
    pub is_response: bool,
    pub request_id: String,
    pub from_system: System,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closest_nodes: Option<Vec<System>>,
    /// Mandatory on the wire; optional here so its absence rejects with the
    /// dedicated missing-attestation code instead of a parse failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    pub version: VersionInfo,
}

impl Envelope {
    /// Build a request envelope with a fresh request ID.
    pub fn request(rpc: RpcType, from_system: System, attestation: Attestation) -> Self {
        Self {
            rpc,
            is_response: false,
            request_id: Uuid::new_v4().hyphenated().to_string(),
            from_system,
            target_id: None,
            closest_nodes: None,
            attestation: Some(attestation),
            version: VersionInfo::current(),
        }
    }

    /// Build the response to this request, echoing its request ID.
    pub fn respond(&self, from_system: System, attestation: Attestation) -> Self {
        Self {
            rpc: self.rpc,
            is_response: true,
            request_id: self.request_id.clone(),
            from_system,
            target_id: None,
            closest_nodes: None,
            attestation: Some(attestation),
            version: VersionInfo::current(),
        }
    }

    /// The attestation, required on every message.
    pub fn require_attestation(&self) -> Result<&Attestation> {
        self.attestation.as_ref().ok_or(Error::MissingAttestation)
    }

    /// Attach a FIND_NODE target.
    pub fn with_target(mut self, target: NodeId) -> Self {
        self.target_id = Some(target.to_string());
        self
    }

    /// Attach the closest-nodes listing of a FIND_NODE response.
    pub fn with_closest(mut self, nodes: Vec<System>) -> Self {
        self.closest_nodes = Some(nodes);
        self
    }

    /// Parse the FIND_NODE target, required on find_node requests.
    pub fn parse_target(&self) -> Result<NodeId> {
        let raw = self
            .target_id
            .as_deref()
            .ok_or_else(|| Error::InvalidMessage("find_node without target_id".into()))?;
        NodeId::from_hex(raw)
            .ok_or_else(|| Error::InvalidMessage(format!("malformed target_id {raw:?}")))
    }

    /// Structural checks that need no stored state: request id present, the
    /// sender UUID is set, and a FIND_NODE request names a target.
    pub fn validate_shape(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(Error::InvalidMessage("empty request_id".into()));
        }
        if self.from_system.uuid.is_nil() {
            return Err(Error::InvalidMessage("nil sender uuid".into()));
        }
        if self.rpc == RpcType::FindNode && !self.is_response {
            self.parse_target()?;
        }
        Ok(())
    }

    /// The attestation type this envelope must carry.
    pub fn expected_attestation_type(&self) -> MessageType {
        self.rpc.attestation_type(self.is_response)
    }
}

/// JSON error payload returned for rejected RPCs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub error: String,
}

impl WireError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.status_code(),
            error: err.to_string(),
        }
    }
}

/// One row of the `GET /api/discovery` listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub id: Uuid,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub peer_address: String,
    pub has_capacity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_core::identity::KeyPair;
    use stellar_core::star;
    use stellar_core::types::Coordinates;

    fn test_system(n: u128) -> System {
        let uuid = Uuid::from_u128(n);
        System {
            uuid,
            name: format!("System {n}"),
            star: star::composition_of(&uuid),
            coordinates: Coordinates::new(1.0, 2.0, 3.0),
            sponsor_id: None,
            public_key: vec![0u8; 32],
            peer_address: "127.0.0.1:4477".into(),
            info_version: 1,
            last_seen: 0,
        }
    }

    fn test_attestation(rpc: RpcType, is_response: bool) -> Attestation {
        let kp = KeyPair::from_seed(&[1u8; 32]);
        Attestation::sign(
            Uuid::from_u128(1),
            Uuid::nil(),
            rpc.attestation_type(is_response),
            1000,
            &kp,
        )
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::request(RpcType::Ping, test_system(1), test_attestation(RpcType::Ping, false));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["is_response"], false);
        assert!(json.get("target_id").is_none());
        assert!(json.get("closest_nodes").is_none());
        assert!(json["attestation"]["signature"].is_string());
        assert_eq!(json["version"]["software"], "stellard");
    }

    #[test]
    fn test_missing_attestation_distinct() {
        let env = Envelope::request(RpcType::Ping, test_system(1), test_attestation(RpcType::Ping, false));
        let mut json = serde_json::to_value(&env).unwrap();
        json.as_object_mut().unwrap().remove("attestation");
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert!(matches!(
            parsed.require_attestation(),
            Err(Error::MissingAttestation)
        ));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let env = Envelope::request(RpcType::Ping, test_system(1), test_attestation(RpcType::Ping, false));
        let mut json = serde_json::to_value(&env).unwrap();
        json["future_field"] = serde_json::json!({"nested": true});
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_id, env.request_id);
    }

    #[test]
    fn test_find_node_requires_target() {
        let env = Envelope::request(
            RpcType::FindNode,
            test_system(1),
            test_attestation(RpcType::FindNode, false),
        );
        assert!(env.validate_shape().is_err());

        let target = NodeId::from_uuid(&Uuid::from_u128(9));
        let env = env.with_target(target);
        assert!(env.validate_shape().is_ok());
        assert_eq!(env.parse_target().unwrap(), target);
    }

    #[test]
    fn test_response_echoes_request_id() {
        let req = Envelope::request(RpcType::Announce, test_system(1), test_attestation(RpcType::Announce, false));
        let resp = req
            .respond(test_system(2), test_attestation(RpcType::Announce, true))
            .with_closest(vec![test_system(3)]);
        assert!(resp.is_response);
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(
            resp.expected_attestation_type(),
            MessageType::AnnounceResponse
        );
        assert_eq!(resp.closest_nodes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_attestation_type_mapping() {
        assert_eq!(RpcType::Ping.attestation_type(false), MessageType::Ping);
        assert_eq!(RpcType::Ping.attestation_type(true), MessageType::PingResponse);
        assert_eq!(
            RpcType::FindNode.attestation_type(true),
            MessageType::FindNodeResponse
        );
        assert_eq!(RpcType::Announce.attestation_type(false), MessageType::Announce);
    }
}
