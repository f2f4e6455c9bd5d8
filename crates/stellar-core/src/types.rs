//! Core protocol types for Stellar Lab
//!
//! All wire-visible types serialize via serde_json. Field order matters for
//! the canonically signed shapes (see [`crate::attestation`]).

use crate::encoding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// =============================================================================
// NODE ID (128-bit XOR metric space)
// =============================================================================

/// Routing identifier: first 128 bits of SHA-256 over the lowercase
/// hyphenated UUID string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 16]);

/// Number of buckets in the routing table (one per possible prefix length).
pub const ID_BITS: usize = 128;

impl NodeId {
    /// Derive the routing ID for a system UUID.
    pub fn from_uuid(uuid: &Uuid) -> Self {
        let digest = Sha256::digest(uuid.hyphenated().to_string().as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    /// XOR distance to another ID.
    pub fn distance(&self, other: &NodeId) -> [u8; 16] {
        let mut d = [0u8; 16];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        d
    }

    /// Length of the shared bit prefix with another ID (0..=128).
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        let mut len = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let x = a ^ b;
            if x == 0 {
                len += 8;
            } else {
                len += x.leading_zeros() as usize;
                break;
            }
        }
        len
    }

    /// Compare two IDs by XOR distance to `self`.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Parse from the 32-char lowercase hex wire form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// =============================================================================
// STAR COMPOSITION
// =============================================================================

/// Spectral class of a star system.
///
/// Class X exists only at the origin, held by the lone genesis system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StarClass {
    O,
    B,
    A,
    F,
    G,
    K,
    M,
    X,
}

impl StarClass {
    /// Baseline peer capacity for this class.
    pub fn base_capacity(&self) -> usize {
        match self {
            StarClass::X => 20,
            StarClass::O => 18,
            StarClass::B => 16,
            StarClass::A => 15,
            StarClass::F => 14,
            StarClass::G => 12,
            StarClass::K => 11,
            StarClass::M => 10,
        }
    }

    /// All classes a non-genesis peer may claim.
    pub const PEER_CLASSES: [StarClass; 7] = [
        StarClass::O,
        StarClass::B,
        StarClass::A,
        StarClass::F,
        StarClass::G,
        StarClass::K,
        StarClass::M,
    ];
}

impl fmt::Display for StarClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How many stars share the system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    #[default]
    Single,
    Binary,
    Trinary,
}

impl Multiplicity {
    /// Extra peer capacity granted by companion stars.
    pub fn capacity_bonus(&self) -> usize {
        match self {
            Multiplicity::Single => 0,
            Multiplicity::Binary => 3,
            Multiplicity::Trinary => 5,
        }
    }
}

/// Full star composition of one system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarComposition {
    pub primary: StarClass,
    pub secondary: Option<StarClass>,
    pub tertiary: Option<StarClass>,
    pub multiplicity: Multiplicity,
}

impl StarComposition {
    /// Total peer capacity: class baseline plus multiplicity bonus.
    ///
    /// This single value is the per-bucket K, the FIND_NODE response cap,
    /// and the verified-peer total beyond which new peers are refused.
    pub fn capacity(&self) -> usize {
        self.primary.base_capacity() + self.multiplicity.capacity_bonus()
    }
}

// =============================================================================
// COORDINATES
// =============================================================================

/// Position in the shared 3-D galaxy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// The galactic origin, reserved for the genesis system.
pub const ORIGIN: Coordinates = Coordinates {
    x: 0.0,
    y: 0.0,
    z: 0.0,
};

impl Coordinates {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_origin(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

// =============================================================================
// SYSTEM RECORDS
// =============================================================================

/// A star system's full public record.
///
/// This is both the locally persisted self-identity and the `from_system`
/// payload of every wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub uuid: Uuid,
    pub name: String,
    pub star: StarComposition,
    pub coordinates: Coordinates,
    pub sponsor_id: Option<Uuid>,
    #[serde(with = "encoding::b64")]
    pub public_key: Vec<u8>,
    pub peer_address: String,
    pub info_version: u64,
    pub last_seen: u64,
}

impl System {
    /// Routing ID derived from the UUID.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_uuid(&self.uuid)
    }

    /// Bump the info version after an owner-side mutation.
    pub fn touch(&mut self) {
        self.info_version += 1;
        self.last_seen = unix_now();
    }
}

/// Cached record of a remote system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub uuid: Uuid,
    #[serde(with = "encoding::b64")]
    pub public_key: Vec<u8>,
    pub name: String,
    pub star: StarComposition,
    pub coordinates: Coordinates,
    pub peer_address: String,
    pub last_verified: u64,
    pub fail_count: u32,
    pub info_version: u64,
    pub sponsor_id: Option<Uuid>,
}

impl PeerRecord {
    /// Build a fresh record from a wire system payload.
    pub fn from_system(sys: &System) -> Self {
        Self {
            uuid: sys.uuid,
            public_key: sys.public_key.clone(),
            name: sys.name.clone(),
            star: sys.star,
            coordinates: sys.coordinates,
            peer_address: sys.peer_address.clone(),
            last_verified: 0,
            fail_count: 0,
            info_version: sys.info_version,
            sponsor_id: sys.sponsor_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_uuid(&self.uuid)
    }

    /// Wire system payload for FIND_NODE responses and sync listings.
    pub fn to_system(&self) -> System {
        System {
            uuid: self.uuid,
            name: self.name.clone(),
            star: self.star,
            coordinates: self.coordinates,
            sponsor_id: self.sponsor_id,
            public_key: self.public_key.clone(),
            peer_address: self.peer_address.clone(),
            info_version: self.info_version,
            last_seen: self.last_verified,
        }
    }

    /// Merge a newer wire payload for the same UUID.
    pub fn absorb(&mut self, sys: &System) {
        if sys.info_version >= self.info_version {
            self.name = sys.name.clone();
            self.star = sys.star;
            self.coordinates = sys.coordinates;
            self.peer_address = sys.peer_address.clone();
            self.info_version = sys.info_version;
            self.sponsor_id = sys.sponsor_id;
        }
    }
}

// =============================================================================
// NAME VALIDATION
// =============================================================================

/// Sentinels that are never acceptable system names.
const PLACEHOLDER_NAMES: [&str; 6] = ["unknown", "unnamed", "placeholder", "null", "undefined", "test"];

/// Maximum name length in code points.
pub const MAX_NAME_LEN: usize = 64;

/// Check a system name: 1..=64 printable code points, no placeholder sentinels.
pub fn validate_name(name: &str) -> crate::error::Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(crate::Error::InvalidMessage("empty system name".into()));
    }
    let count = name.chars().count();
    if count > MAX_NAME_LEN {
        return Err(crate::Error::InvalidMessage(format!(
            "system name too long ({count} > {MAX_NAME_LEN})"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidMessage(
            "system name contains control characters".into(),
        ));
    }
    let lower = trimmed.to_lowercase();
    if PLACEHOLDER_NAMES.contains(&lower.as_str()) {
        return Err(crate::Error::InvalidMessage(format!(
            "placeholder system name {trimmed:?}"
        )));
    }
    Ok(())
}
