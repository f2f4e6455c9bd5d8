//! Node state wiring
//!
//! One `Node` owns every shared component: the self record, keypair, sled
//! store, routing table, system cache, outbound client, and the shutdown
//! broadcast. State mutations go through short-lived lock scopes; no lock is
//! held across network I/O.

use crate::config::Config;
use crate::storage::{BindOutcome, Store};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stellar_core::attestation::{self, Attestation, MessageType, DEFAULT_DRIFT_SECS};
use stellar_core::error::{Error, Result};
use stellar_core::identity::{Identity, KeyPair};
use stellar_core::star;
use stellar_core::types::{unix_now, Coordinates, NodeId, PeerRecord, StarClass, System, ORIGIN};
use stellar_core::version::ProtocolVersion;
use stellar_net::client::ClientError;
use stellar_net::routing::InsertOutcome;
use stellar_net::wire::{Envelope, RpcType};
use stellar_net::{RoutingTable, RpcClient, SystemCache};
use thiserror::Error as ThisError;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound RPC timeout.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive failures before a peer is evicted.
pub const F_MAX: u32 = 3;
/// Upper bound on the observed-system cache.
pub const CACHE_MAX_ENTRIES: usize = 10_000;
/// A peer verified within this window counts as recent for the health label.
const RECENT_VERIFY_SECS: u64 = 600;

/// Why an outbound RPC failed.
#[derive(Debug, ThisError)]
pub enum RpcFailure {
    #[error(transparent)]
    Transport(#[from] ClientError),
    #[error(transparent)]
    Protocol(#[from] Error),
}

impl RpcFailure {
    /// The remote refused us because its routing table is full.
    pub fn is_at_capacity(&self) -> bool {
        match self {
            RpcFailure::Transport(e) => e.is_at_capacity(),
            RpcFailure::Protocol(Error::AtCapacity { .. }) => true,
            _ => false,
        }
    }
}

/// Operator-facing connectivity label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Healthy,
    LowConnectivity,
    Isolated,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Healthy => f.write_str("Healthy"),
            Connectivity::LowConnectivity => f.write_str("Low Connectivity"),
            Connectivity::Isolated => f.write_str("Isolated"),
        }
    }
}

/// Shared node state.
pub struct Node {
    /// Genesis self-promotion allowed when bootstrap finds nobody.
    pub isolated_mode: bool,
    pub system: RwLock<System>,
    pub keypair: KeyPair,
    pub store: Arc<Store>,
    pub routing: RwLock<RoutingTable>,
    pub cache: RwLock<SystemCache>,
    pub client: RpcClient,
    /// Negotiated protocol versions per peer.
    pub peer_versions: RwLock<HashMap<Uuid, ProtocolVersion>>,
    pub started_at: u64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Assemble the node from config, identity, and an opened store.
    pub fn new(config: &Config, identity: Identity, store: Arc<Store>) -> Result<Arc<Self>> {
        let now = unix_now();
        let advertised = config.advertised_address();

        let system = match store.load_system()? {
            Some(mut sys) => {
                if sys.name != config.name || sys.peer_address != advertised {
                    sys.name = config.name.clone();
                    sys.peer_address = advertised;
                    sys.touch();
                    store.save_system(&sys)?;
                }
                sys
            }
            None => {
                let sys = System {
                    uuid: identity.uuid,
                    name: config.name.clone(),
                    star: star::composition_of(&identity.uuid),
                    coordinates: ORIGIN,
                    sponsor_id: None,
                    public_key: identity.keypair.public_key().to_vec(),
                    peer_address: advertised,
                    info_version: 1,
                    last_seen: now,
                };
                store.save_system(&sys)?;
                sys
            }
        };

        // Establish our own binding; a conflict here means the identity file
        // and the database disagree, which is unrecoverable.
        if store.identity_bind(&system.uuid, &system.public_key)? == BindOutcome::Conflict {
            return Err(Error::IdentityConflict {
                uuid: system.uuid.hyphenated().to_string(),
            });
        }

        let k = system.star.capacity();
        let routing = RoutingTable::new(system.node_id(), k, k);
        let client = RpcClient::new(RPC_TIMEOUT).map_err(|e| Error::Internal(e.to_string()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            isolated_mode: config.isolated,
            system: RwLock::new(system),
            keypair: identity.keypair,
            store,
            routing: RwLock::new(routing),
            cache: RwLock::new(SystemCache::new(CACHE_MAX_ENTRIES)),
            client,
            peer_versions: RwLock::new(HashMap::new()),
            started_at: now,
            shutdown_tx,
        }))
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn self_system(&self) -> System {
        self.system.read().clone()
    }

    pub fn self_uuid(&self) -> Uuid {
        self.system.read().uuid
    }

    pub fn self_node_id(&self) -> NodeId {
        self.system.read().node_id()
    }

    /// Class-determined K: bucket size, lookup width, announce fan-out.
    pub fn k(&self) -> usize {
        self.routing.read().k()
    }

    /// Sign a fresh attestation from us to `to`.
    pub fn attest(&self, to: Uuid, message_type: MessageType) -> Attestation {
        Attestation::sign(self.self_uuid(), to, message_type, unix_now(), &self.keypair)
    }

    /// Operator connectivity label from table size and recent verifications.
    pub fn connectivity(&self) -> Connectivity {
        let routing = self.routing.read();
        if routing.is_empty() {
            return Connectivity::Isolated;
        }
        let now = unix_now();
        let recent = routing
            .all_peers()
            .iter()
            .any(|p| now.saturating_sub(p.last_verified) <= RECENT_VERIFY_SECS);
        if routing.len() >= 3 && recent {
            Connectivity::Healthy
        } else {
            Connectivity::LowConnectivity
        }
    }

    // -------------------------------------------------------------------------
    // Inbound validation
    // -------------------------------------------------------------------------

    /// The full inbound validation pipeline. Order matters: each failure maps
    /// to its own reject code.
    pub fn validate_envelope(&self, envelope: &Envelope) -> Result<Attestation> {
        // (1) envelope well-formed
        envelope.validate_shape()?;
        // (2) attestation present
        let att = envelope.require_attestation()?.clone();
        // (3)-(6) signature, sender match, recipient is self or nil, drift
        let sender = envelope.from_system.uuid;
        attestation::validate_inbound(&att, &sender, &self.self_uuid(), unix_now(), DEFAULT_DRIFT_SECS)?;
        // The attested type must match the RPC direction it arrived on.
        if att.message_type != envelope.expected_attestation_type() {
            return Err(Error::InvalidAttestation(format!(
                "attestation type {} does not match rpc",
                att.message_type
            )));
        }
        // (7) name conforms
        stellar_core::types::validate_name(&envelope.from_system.name)?;
        // (8) star class in the allowed set (X only as genesis at the origin)
        star::validate_genesis_claim(&envelope.from_system.star, &envelope.from_system.coordinates)?;
        // (9) identity binding holds
        if self.store.identity_bind(&sender, &envelope.from_system.public_key)?
            == BindOutcome::Conflict
        {
            return Err(Error::IdentityConflict {
                uuid: sender.hyphenated().to_string(),
            });
        }
        // (10) coordinates validate against the claimed sponsor, when known
        if let Some(sponsor_id) = envelope.from_system.sponsor_id {
            if let Some(sponsor_pos) = self.known_position(&sponsor_id) {
                star::validate_coordinates(
                    &envelope.from_system.coordinates,
                    &sender,
                    &sponsor_id,
                    &sponsor_pos,
                )?;
            }
        }
        // (11) protocol major matches; record the negotiated version
        let theirs = envelope.version.check_compatible()?;
        self.peer_versions.write().insert(sender, theirs);

        Ok(att)
    }

    /// Position of a system we already know about, if any.
    fn known_position(&self, uuid: &Uuid) -> Option<Coordinates> {
        {
            let sys = self.system.read();
            if sys.uuid == *uuid {
                return Some(sys.coordinates);
            }
        }
        if let Some(entry) = self.cache.read().get(uuid) {
            return Some(entry.record.coordinates);
        }
        self.store
            .get_peer_system(uuid)
            .ok()
            .flatten()
            .map(|p| p.coordinates)
    }

    /// Store a received attestation (idempotent on the signed tuple).
    pub fn record_attestation(&self, att: &Attestation) {
        match self.store.save_attestation(att) {
            Ok(true) => debug!(from = %att.from, kind = %att.message_type, "attestation stored"),
            Ok(false) => {}
            Err(e) => warn!("attestation store failed: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Peer absorption
    // -------------------------------------------------------------------------

    /// Absorb a system we spoke to directly: cache it as verified, refresh
    /// any routing entry, persist it for cached rejoin.
    pub fn absorb_contact(&self, sys: &System) {
        let now = unix_now();
        let mut record = PeerRecord::from_system(sys);
        record.last_verified = now;
        self.cache.write().observe_verified(record.clone(), now);
        self.routing.write().mark_verified(&sys.uuid, now);
        if let Err(e) = self.store.save_peer_system(&record) {
            warn!("peer persist failed: {e}");
        }
        self.maybe_adopt_sponsor(sys.uuid, &sys.coordinates);
    }

    /// Insert a verified peer with the full bucket policy. When a bucket is
    /// full the least-recently-verified occupant is probed with one PING,
    /// outside any lock, and the winner keeps the slot.
    pub async fn insert_verified_peer(&self, sys: &System) -> Result<()> {
        let now = unix_now();
        let record = PeerRecord::from_system(sys);
        let outcome = self.routing.write().upsert_verified(record.clone(), now)?;
        if let InsertOutcome::Full { lrv } = outcome {
            match self.ping(&lrv.peer_address, lrv.uuid).await {
                Ok(_) => {
                    self.routing.write().keep_old(&lrv.uuid, unix_now());
                    debug!(kept = %lrv.uuid, dropped = %sys.uuid, "bucket probe kept old entry");
                }
                Err(_) => {
                    let mut routing = self.routing.write();
                    if !routing.replace(&lrv.uuid, record.clone(), unix_now()) {
                        // The probe failure already evicted the old entry.
                        routing.upsert_verified(record, unix_now()).ok();
                    }
                    debug!(evicted = %lrv.uuid, inserted = %sys.uuid, "bucket probe evicted old entry");
                }
            }
        }
        Ok(())
    }

    /// Count a failure against a peer; evict from the routing table at F_MAX.
    pub fn mark_peer_failed(&self, uuid: &Uuid) {
        if let Some(evicted) = self.routing.write().mark_failed(uuid, F_MAX) {
            info!(peer = %evicted.uuid, "peer evicted after repeated failures");
            if let Err(e) = self.store.remove_peer_system(uuid) {
                warn!("peer removal failed: {e}");
            }
        }
        self.cache.write().mark_probe_failed(uuid);
    }

    /// An isolated, sponsor-less node adopts its first direct contact as
    /// sponsor and takes deterministic clustered coordinates near it.
    pub fn maybe_adopt_sponsor(&self, sponsor: Uuid, sponsor_pos: &Coordinates) {
        let mut sys = self.system.write();
        if sys.sponsor_id.is_some()
            || sys.star.primary == StarClass::X
            || !sys.coordinates.is_origin()
            || sponsor == sys.uuid
        {
            return;
        }
        sys.sponsor_id = Some(sponsor);
        sys.coordinates = star::coordinates_for(&sys.uuid, &sponsor, sponsor_pos);
        sys.touch();
        info!(sponsor = %sponsor, x = sys.coordinates.x, y = sys.coordinates.y, z = sys.coordinates.z,
            "adopted sponsor and clustered coordinates");
        if let Err(e) = self.store.save_system(&sys) {
            warn!("self record persist failed: {e}");
        }
    }

    /// Become the lone class-X genesis system at the origin.
    pub fn promote_to_genesis(&self) -> Result<()> {
        let mut sys = self.system.write();
        sys.star = star::genesis_composition();
        sys.coordinates = ORIGIN;
        sys.sponsor_id = None;
        sys.touch();
        self.store.save_system(&sys)?;
        let k = sys.star.capacity();
        *self.routing.write() = RoutingTable::new(sys.node_id(), k, k);
        info!(uuid = %sys.uuid, "promoted to genesis at the origin");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Outbound RPCs
    // -------------------------------------------------------------------------

    fn build_request(&self, rpc: RpcType, to: Uuid) -> Envelope {
        let attestation = self.attest(to, rpc.attestation_type(false));
        Envelope::request(rpc, self.self_system(), attestation)
    }

    /// Ship a request, then run the response through the same validation
    /// pipeline inbound traffic gets.
    async fn send_validated(
        &self,
        addr: &str,
        envelope: Envelope,
    ) -> std::result::Result<Envelope, RpcFailure> {
        let response = self.client.send_dht(addr, &envelope).await?;
        if !response.is_response || response.request_id != envelope.request_id {
            return Err(Error::InvalidMessage("response does not match request".into()).into());
        }
        let att = self.validate_envelope(&response)?;
        self.record_attestation(&att);
        self.absorb_contact(&response.from_system);
        Ok(response)
    }

    /// PING a peer: liveness plus identity exchange.
    pub async fn ping(&self, addr: &str, to: Uuid) -> std::result::Result<System, RpcFailure> {
        let request = self.build_request(RpcType::Ping, to);
        match self.send_validated(addr, request).await {
            Ok(response) => Ok(response.from_system),
            Err(e) => {
                if !to.is_nil() {
                    self.mark_peer_failed(&to);
                }
                Err(e)
            }
        }
    }

    /// ANNOUNCE ourselves to a peer so it registers us.
    pub async fn announce(&self, addr: &str, to: Uuid) -> std::result::Result<(), RpcFailure> {
        let request = self.build_request(RpcType::Announce, to);
        match self.send_validated(addr, request).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Capacity refusal is the peer's policy, not its death.
                if !to.is_nil() && !e.is_at_capacity() {
                    self.mark_peer_failed(&to);
                }
                Err(e)
            }
        }
    }

    /// FIND_NODE: ask a peer for its closest systems to `target` and merge
    /// the listing into the cache as gossip.
    pub async fn find_node(
        &self,
        addr: &str,
        to: Uuid,
        target: NodeId,
    ) -> std::result::Result<Vec<System>, RpcFailure> {
        let request = self.build_request(RpcType::FindNode, to).with_target(target);
        match self.send_validated(addr, request).await {
            Ok(response) => {
                let nodes = response.closest_nodes.unwrap_or_default();
                let now = unix_now();
                let self_uuid = self.self_uuid();
                {
                    let mut cache = self.cache.write();
                    for sys in &nodes {
                        if sys.uuid == self_uuid {
                            continue;
                        }
                        cache.observe_rumor(PeerRecord::from_system(sys), Some(to), now);
                    }
                }
                for sys in &nodes {
                    if sys.uuid == self_uuid {
                        continue;
                    }
                    if let Err(e) = self.store.record_connection(&to, &sys.uuid, now) {
                        warn!("connection record failed: {e}");
                        break;
                    }
                }
                Ok(nodes)
            }
            Err(e) => {
                if !to.is_nil() {
                    self.mark_peer_failed(&to);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;
    use stellar_core::identity::UuidMode;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path) -> Arc<Node> {
        let config = Config::parse_from([
            "stellard",
            "--name",
            "Test Reach",
            "--data-dir",
            dir.to_str().unwrap(),
        ]);
        let identity = Identity::load_or_create(&config.identity_path(), &UuidMode::Random).unwrap();
        let store = Arc::new(Store::open(config.db_path()).unwrap());
        Node::new(&config, identity, store).unwrap()
    }

    fn remote_system(n: u128, keypair: &KeyPair) -> System {
        let uuid = Uuid::from_u128(n);
        System {
            uuid,
            name: format!("Remote {n}"),
            star: star::composition_of(&uuid),
            coordinates: Coordinates::new(10.0, 20.0, 30.0),
            sponsor_id: None,
            public_key: keypair.public_key().to_vec(),
            peer_address: "127.0.0.1:9999".into(),
            info_version: 1,
            last_seen: unix_now(),
        }
    }

    fn signed_ping(node: &Node, sys: &System, keypair: &KeyPair) -> Envelope {
        let att = Attestation::sign(
            sys.uuid,
            node.self_uuid(),
            MessageType::Ping,
            unix_now(),
            keypair,
        );
        Envelope::request(RpcType::Ping, sys.clone(), att)
    }

    #[test]
    fn test_node_identity_idempotent() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let uuid = node.self_uuid();
        drop(node);
        let node = test_node(dir.path());
        assert_eq!(node.self_uuid(), uuid);
    }

    #[test]
    fn test_valid_ping_accepted() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let sys = remote_system(50, &kp);
        let env = signed_ping(&node, &sys, &kp);
        let att = node.validate_envelope(&env).unwrap();
        assert_eq!(att.from, sys.uuid);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let sys = remote_system(50, &kp);
        let mut env = signed_ping(&node, &sys, &kp);
        env.attestation.as_mut().unwrap().signature[0] ^= 0x01;
        let err = node.validate_envelope(&env).unwrap_err();
        assert_eq!(err.status_code(), 402);
    }

    #[test]
    fn test_identity_spoof_rejected_binding_unchanged() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp1 = KeyPair::from_seed(&[5u8; 32]);
        let sys = remote_system(50, &kp1);
        node.validate_envelope(&signed_ping(&node, &sys, &kp1)).unwrap();

        // Same UUID, different keypair.
        let kp2 = KeyPair::from_seed(&[6u8; 32]);
        let spoofed = remote_system(50, &kp2);
        let err = node
            .validate_envelope(&signed_ping(&node, &spoofed, &kp2))
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(
            node.store.get_binding(&sys.uuid).unwrap().unwrap(),
            kp1.public_key().to_vec()
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let sys = remote_system(50, &kp);
        let att = Attestation::sign(
            sys.uuid,
            node.self_uuid(),
            MessageType::Ping,
            unix_now() - DEFAULT_DRIFT_SECS - 5,
            &kp,
        );
        let env = Envelope::request(RpcType::Ping, sys, att);
        assert_eq!(node.validate_envelope(&env).unwrap_err().status_code(), 402);
    }

    #[test]
    fn test_placeholder_name_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let mut sys = remote_system(50, &kp);
        sys.name = "unknown".into();
        let env = signed_ping(&node, &sys, &kp);
        assert_eq!(node.validate_envelope(&env).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_false_genesis_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let mut sys = remote_system(50, &kp);
        sys.star.primary = StarClass::X;
        let env = signed_ping(&node, &sys, &kp);
        assert_eq!(node.validate_envelope(&env).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_incompatible_major_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let sys = remote_system(50, &kp);
        let mut env = signed_ping(&node, &sys, &kp);
        env.version.protocol = "2.0.0".into();
        assert_eq!(node.validate_envelope(&env).unwrap_err().status_code(), 403);
    }

    #[test]
    fn test_coordinate_conflict_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());

        // Teach the node about a sponsor first.
        let sponsor_kp = KeyPair::from_seed(&[7u8; 32]);
        let sponsor = remote_system(70, &sponsor_kp);
        node.absorb_contact(&sponsor);

        // Claim the sponsor but the wrong position.
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let mut sys = remote_system(50, &kp);
        sys.sponsor_id = Some(sponsor.uuid);
        sys.coordinates = Coordinates::new(-999.0, -999.0, -999.0);
        let env = signed_ping(&node, &sys, &kp);
        assert_eq!(node.validate_envelope(&env).unwrap_err().status_code(), 409);

        // The honest derivation passes.
        sys.coordinates = star::coordinates_for(&sys.uuid, &sponsor.uuid, &sponsor.coordinates);
        let env = signed_ping(&node, &sys, &kp);
        assert!(node.validate_envelope(&env).is_ok());
    }

    #[test]
    fn test_sponsor_adoption() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        assert!(node.self_system().coordinates.is_origin());

        let kp = KeyPair::from_seed(&[5u8; 32]);
        let sponsor = remote_system(50, &kp);
        node.maybe_adopt_sponsor(sponsor.uuid, &sponsor.coordinates);

        let sys = node.self_system();
        assert_eq!(sys.sponsor_id, Some(sponsor.uuid));
        let dist = sys.coordinates.distance_to(&sponsor.coordinates);
        assert!((star::MIN_OFFSET..=star::MAX_OFFSET).contains(&dist));

        // A second contact does not displace the sponsor.
        let other = remote_system(51, &kp);
        node.maybe_adopt_sponsor(other.uuid, &other.coordinates);
        assert_eq!(node.self_system().sponsor_id, Some(sponsor.uuid));
    }

    #[test]
    fn test_promote_to_genesis() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        node.promote_to_genesis().unwrap();
        let sys = node.self_system();
        assert_eq!(sys.star.primary, StarClass::X);
        assert!(sys.coordinates.is_origin());
        assert_eq!(sys.sponsor_id, None);
        assert_eq!(node.k(), 20);
        // Genesis never adopts a sponsor afterwards.
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let contact = remote_system(50, &kp);
        node.maybe_adopt_sponsor(contact.uuid, &contact.coordinates);
        assert_eq!(node.self_system().sponsor_id, None);
    }

    #[test]
    fn test_connectivity_labels() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        assert_eq!(node.connectivity(), Connectivity::Isolated);

        let kp = KeyPair::from_seed(&[5u8; 32]);
        let now = unix_now();
        for n in 50..52u128 {
            let record = PeerRecord::from_system(&remote_system(n, &kp));
            node.routing.write().upsert_verified(record, now).unwrap();
        }
        assert_eq!(node.connectivity(), Connectivity::LowConnectivity);

        let record = PeerRecord::from_system(&remote_system(52, &kp));
        node.routing.write().upsert_verified(record, now).unwrap();
        assert_eq!(node.connectivity(), Connectivity::Healthy);
    }
}
