//! Persistent storage using sled
//!
//! One tree per record family. Attestations are keyed by
//! `remote_uuid ∥ timestamp_be ∥ tuple_hash`, which makes writes idempotent
//! on the signed 6-tuple and gives cheap per-peer range scans. Compaction
//! moves raw rows into hourly summaries inside one multi-tree transaction.

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Transactional};
use std::collections::HashMap;
use std::path::Path;
use stellar_core::attestation::{Attestation, MessageType};
use stellar_core::credit::CreditBalance;
use stellar_core::encoding;
use stellar_core::types::{PeerRecord, System};
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compaction transaction failed: {0}")]
    Compaction(String),
}

impl From<StorageError> for stellar_core::Error {
    fn from(e: StorageError) -> Self {
        stellar_core::Error::Internal(e.to_string())
    }
}

/// Result of an identity binding attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// First sighting; the binding was written.
    Bound,
    /// The stored binding matches the claimed key.
    Match,
    /// The stored binding contradicts the claimed key.
    Conflict,
}

/// A stored attestation with its derived direction.
///
/// Every stored attestation was received by this node, so `from` is always
/// the remote peer. `outbound` marks response attestations, i.e. proof of an
/// RPC this node initiated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAttestation {
    pub attestation: Attestation,
    pub outbound: bool,
}

/// Hourly aggregate of raw attestations for one (peer, direction) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationSummary {
    pub peer: Uuid,
    pub outbound: bool,
    pub period_start: u64,
    pub period_end: u64,
    pub counts: HashMap<MessageType, u64>,
    #[serde(with = "encoding::b64")]
    pub sample_signature: Vec<u8>,
}

impl AttestationSummary {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Outcome of one compaction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CompactionStats {
    pub rows_deleted: usize,
    pub summaries_written: usize,
}

/// Storage backend for stellard
pub struct Store {
    db: Db,
    /// Self record: "self" -> System
    system: sled::Tree,
    /// Peer records: uuid -> PeerRecord
    peers: sled::Tree,
    /// Raw attestations: remote ∥ ts_be ∥ tuple_hash -> StoredAttestation
    attestations: sled::Tree,
    /// Summaries: peer ∥ hour_be ∥ direction -> AttestationSummary
    summaries: sled::Tree,
    /// Identity bindings: uuid -> public key bytes (append-only)
    bindings: sled::Tree,
    /// Credit balances: uuid -> CreditBalance
    credit: sled::Tree,
    /// Observed gossip edges: a ∥ b -> last_seen
    connections: sled::Tree,
}

fn attestation_key(att: &Attestation) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(att.from.as_bytes());
    key.extend_from_slice(&att.timestamp.to_be_bytes());
    key.extend_from_slice(&att.tuple_key()[..8]);
    key
}

fn summary_key(peer: &Uuid, hour_start: u64, outbound: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(25);
    key.extend_from_slice(peer.as_bytes());
    key.extend_from_slice(&hour_start.to_be_bytes());
    key.push(outbound as u8);
    key
}

fn connection_key(a: &Uuid, b: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(a.as_bytes());
    key.extend_from_slice(b.as_bytes());
    key
}

impl Store {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let system = db.open_tree("system")?;
        let peers = db.open_tree("peers")?;
        let attestations = db.open_tree("attestations")?;
        let summaries = db.open_tree("summaries")?;
        let bindings = db.open_tree("bindings")?;
        let credit = db.open_tree("credit")?;
        let connections = db.open_tree("connections")?;

        Ok(Self {
            db,
            system,
            peers,
            attestations,
            summaries,
            bindings,
            credit,
            connections,
        })
    }

    // -------------------------------------------------------------------------
    // Self record
    // -------------------------------------------------------------------------

    pub fn save_system(&self, sys: &System) -> Result<(), StorageError> {
        self.system.insert(b"self", serde_json::to_vec(sys)?)?;
        Ok(())
    }

    pub fn load_system(&self) -> Result<Option<System>, StorageError> {
        match self.system.get(b"self")? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Peer records
    // -------------------------------------------------------------------------

    pub fn save_peer_system(&self, peer: &PeerRecord) -> Result<(), StorageError> {
        self.peers
            .insert(peer.uuid.as_bytes(), serde_json::to_vec(peer)?)?;
        Ok(())
    }

    pub fn get_peer_system(&self, uuid: &Uuid) -> Result<Option<PeerRecord>, StorageError> {
        match self.peers.get(uuid.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_all_peer_systems(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let mut peers = Vec::new();
        for entry in self.peers.iter() {
            let (_, bytes) = entry?;
            peers.push(serde_json::from_slice(&bytes)?);
        }
        Ok(peers)
    }

    pub fn remove_peer_system(&self, uuid: &Uuid) -> Result<(), StorageError> {
        self.peers.remove(uuid.as_bytes())?;
        Ok(())
    }

    /// Drop peers whose fail count reached the eviction threshold.
    pub fn prune_dead_peers(&self, f_max: u32) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in self.peers.iter() {
            let (key, bytes) = entry?;
            let peer: PeerRecord = serde_json::from_slice(&bytes)?;
            if peer.fail_count >= f_max {
                self.peers.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop peer records not verified within `max_age_secs`.
    pub fn prune_peer_systems(&self, max_age_secs: u64, now: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in self.peers.iter() {
            let (key, bytes) = entry?;
            let peer: PeerRecord = serde_json::from_slice(&bytes)?;
            if now.saturating_sub(peer.last_verified) > max_age_secs {
                self.peers.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Attestations
    // -------------------------------------------------------------------------

    /// Store a received attestation. Idempotent on the signed 6-tuple;
    /// returns false for a duplicate.
    pub fn save_attestation(&self, att: &Attestation) -> Result<bool, StorageError> {
        let key = attestation_key(att);
        if self.attestations.contains_key(&key)? {
            return Ok(false);
        }
        let stored = StoredAttestation {
            outbound: att.message_type.is_response(),
            attestation: att.clone(),
        };
        self.attestations
            .insert(key, serde_json::to_vec(&stored)?)?;
        Ok(true)
    }

    /// All raw attestations from one peer.
    pub fn get_attestations(&self, peer: &Uuid) -> Result<Vec<StoredAttestation>, StorageError> {
        self.get_attestations_since(peer, 0)
    }

    /// Raw attestations from one peer at or after `since`.
    pub fn get_attestations_since(
        &self,
        peer: &Uuid,
        since: u64,
    ) -> Result<Vec<StoredAttestation>, StorageError> {
        let mut result = Vec::new();
        for entry in self.attestations.scan_prefix(peer.as_bytes()) {
            let (_, bytes) = entry?;
            let stored: StoredAttestation = serde_json::from_slice(&bytes)?;
            if stored.attestation.timestamp >= since {
                result.push(stored);
            }
        }
        Ok(result)
    }

    /// Every raw attestation at or after `since`, across all peers
    /// (the credit engine's hourly sample).
    pub fn all_attestations_since(&self, since: u64) -> Result<Vec<StoredAttestation>, StorageError> {
        let mut result = Vec::new();
        for entry in self.attestations.iter() {
            let (_, bytes) = entry?;
            let stored: StoredAttestation = serde_json::from_slice(&bytes)?;
            if stored.attestation.timestamp >= since {
                result.push(stored);
            }
        }
        Ok(result)
    }

    /// Aggregate raw attestations older than `cutoff` into hourly
    /// (peer, direction) summaries and delete them in the same transaction.
    ///
    /// At most `max_rows` raw rows are consumed per pass so compaction never
    /// starves the other periodic tasks.
    pub fn compact_attestations(
        &self,
        cutoff: u64,
        max_rows: usize,
    ) -> Result<CompactionStats, StorageError> {
        let mut delete_keys: Vec<Vec<u8>> = Vec::new();
        let mut groups: HashMap<Vec<u8>, AttestationSummary> = HashMap::new();

        for entry in self.attestations.iter() {
            if delete_keys.len() >= max_rows {
                break;
            }
            let (key, bytes) = entry?;
            let stored: StoredAttestation = serde_json::from_slice(&bytes)?;
            let att = &stored.attestation;
            if att.timestamp >= cutoff {
                continue;
            }

            let hour_start = att.timestamp - att.timestamp % 3600;
            let skey = summary_key(&att.from, hour_start, stored.outbound);
            if !groups.contains_key(&skey) {
                // Fold into an existing summary row when one is present.
                let base = match self.summaries.get(&skey)? {
                    Some(raw) => serde_json::from_slice(&raw)?,
                    None => AttestationSummary {
                        peer: att.from,
                        outbound: stored.outbound,
                        period_start: hour_start,
                        period_end: hour_start + 3600,
                        counts: HashMap::new(),
                        sample_signature: att.signature.clone(),
                    },
                };
                groups.insert(skey.clone(), base);
            }
            let summary = groups.get_mut(&skey).expect("group just inserted");
            *summary.counts.entry(att.message_type).or_insert(0) += 1;
            delete_keys.push(key.to_vec());
        }

        if delete_keys.is_empty() {
            return Ok(CompactionStats::default());
        }

        let mut summary_rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(groups.len());
        for (key, summary) in &groups {
            summary_rows.push((key.clone(), serde_json::to_vec(summary)?));
        }

        (&self.attestations, &self.summaries)
            .transaction(|(atts, sums)| {
                for key in &delete_keys {
                    atts.remove(key.as_slice())?;
                }
                for (key, value) in &summary_rows {
                    sums.insert(key.as_slice(), value.as_slice())?;
                }
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| StorageError::Compaction(format!("{:?}", e)))?;

        Ok(CompactionStats {
            rows_deleted: delete_keys.len(),
            summaries_written: summary_rows.len(),
        })
    }

    /// All stored summaries (scoring input and inspection).
    pub fn get_summaries(&self) -> Result<Vec<AttestationSummary>, StorageError> {
        let mut result = Vec::new();
        for entry in self.summaries.iter() {
            let (_, bytes) = entry?;
            result.push(serde_json::from_slice(&bytes)?);
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Identity bindings
    // -------------------------------------------------------------------------

    /// Append-only check-and-set of the (UUID -> public key) binding.
    pub fn identity_bind(&self, uuid: &Uuid, public_key: &[u8]) -> Result<BindOutcome, StorageError> {
        match self
            .bindings
            .compare_and_swap(uuid.as_bytes(), None as Option<&[u8]>, Some(public_key))?
        {
            Ok(()) => Ok(BindOutcome::Bound),
            Err(cas) => {
                let current = cas.current.expect("binding present on CAS failure");
                if current.as_ref() == public_key {
                    Ok(BindOutcome::Match)
                } else {
                    Ok(BindOutcome::Conflict)
                }
            }
        }
    }

    pub fn get_binding(&self, uuid: &Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.bindings.get(uuid.as_bytes())?.map(|v| v.to_vec()))
    }

    // -------------------------------------------------------------------------
    // Credit
    // -------------------------------------------------------------------------

    pub fn get_credit_balance(&self, uuid: &Uuid) -> Result<Option<CreditBalance>, StorageError> {
        match self.credit.get(uuid.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_credit_balance(&self, balance: &CreditBalance) -> Result<(), StorageError> {
        self.credit
            .insert(balance.system_id.as_bytes(), serde_json::to_vec(balance)?)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Gossip edges
    // -------------------------------------------------------------------------

    /// Record that `via` mentioned `subject` in a FIND_NODE response.
    pub fn record_connection(&self, via: &Uuid, subject: &Uuid, now: u64) -> Result<(), StorageError> {
        self.connections
            .insert(connection_key(via, subject), &now.to_be_bytes())?;
        Ok(())
    }

    /// Drop gossip edges older than `max_age_secs`.
    pub fn prune_peer_connections(&self, max_age_secs: u64, now: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in self.connections.iter() {
            let (key, value) = entry?;
            let last_seen = u64::from_be_bytes(value.as_ref().try_into().unwrap_or([0; 8]));
            if now.saturating_sub(last_seen) > max_age_secs {
                self.connections.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
