//! System identity: stable UUID derivation and the Ed25519 keypair
//!
//! The UUID is derived from a hardware fingerprint (or a caller-supplied
//! seed mixed with it) so that re-installing on the same machine rejoins as
//! the same star system. The keypair and UUID persist together in a single
//! owner-only identity file.

use crate::encoding;
use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// How the system UUID is derived on first start.
#[derive(Clone, Debug, Default)]
pub enum UuidMode {
    /// Hash of machine-id, hostname, and first MAC address.
    #[default]
    Hardware,
    /// `SHA-256(seed ∥ fingerprint)`, for reproducible deployments.
    Seeded(String),
    /// Fresh CSPRNG identity, ignoring the hardware.
    Random,
}

/// Ed25519 keypair for signing attestations.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (deterministic recovery).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// The 32-byte secret seed.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against a raw public key.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        let pk: [u8; 32] = public_key
            .try_into()
            .map_err(|_| Error::InvalidAttestation("public key must be 32 bytes".into()))?;
        let sig: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::InvalidAttestation("signature must be 64 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&pk)
            .map_err(|e| Error::InvalidAttestation(format!("bad public key: {e}")))?;
        verifying_key
            .verify(message, &Signature::from_bytes(&sig))
            .map_err(|_| Error::InvalidAttestation("signature verification failed".into()))
    }
}

/// On-disk identity file contents.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    uuid: Uuid,
    #[serde(with = "encoding::b64")]
    keypair_seed: Vec<u8>,
}

/// A loaded local identity.
pub struct Identity {
    pub uuid: Uuid,
    pub keypair: KeyPair,
}

impl Identity {
    /// Load the identity file, or derive and persist a new one.
    ///
    /// Idempotent: the same file yields the same identity across restarts.
    pub fn load_or_create(path: &Path, mode: &UuidMode) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::KeyPersist(format!("read {}: {e}", path.display())))?;
            let stored: StoredIdentity = serde_json::from_str(&raw)?;
            let seed: [u8; 32] = stored
                .keypair_seed
                .as_slice()
                .try_into()
                .map_err(|_| Error::KeyGen("stored seed is not 32 bytes".into()))?;
            return Ok(Self {
                uuid: stored.uuid,
                keypair: KeyPair::from_seed(&seed),
            });
        }

        let uuid = derive_uuid(mode)?;
        let keypair = KeyPair::generate();
        let stored = StoredIdentity {
            uuid,
            keypair_seed: keypair.seed().to_vec(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::KeyPersist(format!("mkdir {}: {e}", parent.display())))?;
        }
        fs::write(path, serde_json::to_vec_pretty(&stored)?)
            .map_err(|e| Error::KeyPersist(format!("write {}: {e}", path.display())))?;
        restrict_permissions(path)?;

        Ok(Self { uuid, keypair })
    }
}

/// Derive the system UUID for the requested mode.
pub fn derive_uuid(mode: &UuidMode) -> Result<Uuid> {
    match mode {
        UuidMode::Hardware => Ok(uuid_from_digest(&hardware_fingerprint())),
        UuidMode::Seeded(seed) => {
            let mut hasher = Sha256::new();
            hasher.update(seed.as_bytes());
            hasher.update(hardware_fingerprint());
            Ok(uuid_from_digest(&hasher.finalize()))
        }
        UuidMode::Random => {
            let mut bytes = [0u8; 16];
            OsRng
                .try_fill_bytes(&mut bytes)
                .map_err(|e| Error::KeyGen(format!("csprng: {e}")))?;
            Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
        }
    }
}

/// Stable per-machine fingerprint: SHA-256 over machine-id, hostname, and the
/// first non-loopback MAC address. Each source is best-effort.
fn hardware_fingerprint() -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
        hasher.update(machine_id.trim().as_bytes());
    }
    if let Ok(hostname) = fs::read_to_string("/etc/hostname") {
        hasher.update(hostname.trim().as_bytes());
    } else if let Ok(hostname) = std::env::var("HOSTNAME") {
        hasher.update(hostname.trim().as_bytes());
    }
    if let Some(mac) = first_mac_address() {
        hasher.update(mac.as_bytes());
    }
    hasher.finalize().into()
}

/// First non-loopback interface MAC, read from sysfs.
fn first_mac_address() -> Option<String> {
    let mut names: Vec<_> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(mac) = fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let mac = mac.trim().to_string();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac);
            }
        }
    }
    None
}

/// First 16 digest bytes as an RFC 4122 UUID (version/variant bits set).
fn uuid_from_digest(digest: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Tighten the identity file to owner read/write only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::KeyPersist(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
