//! XOR routing table with class-sized k-buckets
//!
//! 128 ordered buckets indexed by shared-prefix length with the local derived
//! ID. The table itself never performs I/O: when a bucket is full it hands
//! the least-recently-verified occupant back to the caller, which probes it
//! with a single PING and then either keeps the old entry or replaces it.

use rand::Rng;
use stellar_core::error::{Error, Result};
use stellar_core::types::{NodeId, PeerRecord, ID_BITS};
use uuid::Uuid;

/// One k-bucket: most-recently-verified first.
#[derive(Clone, Debug, Default)]
struct Bucket {
    entries: Vec<PeerRecord>,
    last_access: u64,
}

/// Outcome of inserting a verified peer.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome {
    /// The peer was already present; its record was refreshed.
    Refreshed,
    /// The peer was appended to a bucket with free space.
    Added,
    /// The bucket is full. The caller should PING the returned
    /// least-recently-verified entry and then call [`RoutingTable::keep_old`]
    /// or [`RoutingTable::replace`].
    Full { lrv: PeerRecord },
}

/// The k-bucket routing table. Single writer; wrap in a lock at the call site.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    max_peers: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// `k` is the per-bucket capacity and `max_peers` the verified total
    /// beyond which new peers are refused.
    pub fn new(local_id: NodeId, k: usize, max_peers: usize) -> Self {
        Self {
            local_id,
            k,
            max_peers,
            buckets: vec![Bucket::default(); ID_BITS],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Bucket index for a peer: `128 − sharedPrefixLen − 1`.
    /// None for the local ID itself.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let shared = self.local_id.shared_prefix_len(id);
        if shared >= ID_BITS {
            return None;
        }
        Some(ID_BITS - shared - 1)
    }

    /// Total verified peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    pub fn at_capacity(&self) -> bool {
        self.len() >= self.max_peers
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.get(uuid).is_some()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .find(|p| p.uuid == *uuid)
    }

    /// Insert or refresh a verified peer.
    ///
    /// Policy: refresh in place → append when the bucket has space → hand the
    /// least-recently-verified entry back for probing. A brand-new peer is
    /// refused outright when the table is at its class-determined maximum.
    pub fn upsert_verified(&mut self, mut peer: PeerRecord, now: u64) -> Result<InsertOutcome> {
        let Some(idx) = self.bucket_index(&peer.node_id()) else {
            return Err(Error::InvalidMessage("peer shares the local id".into()));
        };

        peer.last_verified = now;
        peer.fail_count = 0;

        let bucket = &mut self.buckets[idx];
        bucket.last_access = now;

        if let Some(pos) = bucket.entries.iter().position(|p| p.uuid == peer.uuid) {
            let mut existing = bucket.entries.remove(pos);
            existing.absorb(&peer.to_system());
            existing.last_verified = now;
            existing.fail_count = 0;
            bucket.entries.insert(0, existing);
            return Ok(InsertOutcome::Refreshed);
        }

        if self.at_capacity() {
            return Err(Error::AtCapacity {
                capacity: self.max_peers,
            });
        }

        let bucket = &mut self.buckets[idx];
        if bucket.entries.len() < self.k {
            bucket.entries.insert(0, peer);
            return Ok(InsertOutcome::Added);
        }

        let lrv = bucket.entries.last().expect("full bucket").clone();
        Ok(InsertOutcome::Full { lrv })
    }

    /// After a successful probe of the LRV entry: keep it, discard the new peer.
    pub fn keep_old(&mut self, lrv: &Uuid, now: u64) {
        self.mark_verified(lrv, now);
    }

    /// After a failed probe: evict the old entry and insert the new peer.
    pub fn replace(&mut self, old: &Uuid, mut peer: PeerRecord, now: u64) -> bool {
        let Some(idx) = self.bucket_index(&peer.node_id()) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|p| p.uuid == *old) else {
            return false;
        };
        bucket.entries.remove(pos);
        peer.last_verified = now;
        peer.fail_count = 0;
        bucket.entries.insert(0, peer);
        true
    }

    /// Reset fail count and move the peer to the fresh end of its bucket.
    pub fn mark_verified(&mut self, uuid: &Uuid, now: u64) -> bool {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.entries.iter().position(|p| p.uuid == *uuid) {
                let mut peer = bucket.entries.remove(pos);
                peer.last_verified = now;
                peer.fail_count = 0;
                bucket.entries.insert(0, peer);
                return true;
            }
        }
        false
    }

    /// Increment the peer's fail count; evict at `f_max`.
    pub fn mark_failed(&mut self, uuid: &Uuid, f_max: u32) -> Option<PeerRecord> {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.entries.iter().position(|p| p.uuid == *uuid) {
                bucket.entries[pos].fail_count += 1;
                if bucket.entries[pos].fail_count >= f_max {
                    return Some(bucket.entries.remove(pos));
                }
                return None;
            }
        }
        None
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<PeerRecord> {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.entries.iter().position(|p| p.uuid == *uuid) {
                return Some(bucket.entries.remove(pos));
            }
        }
        None
    }

    /// The `n` peers closest to `target` by XOR distance, ascending, with
    /// lower UUID string breaking ties. Records the bucket access.
    pub fn closest(&mut self, target: &NodeId, n: usize, now: u64) -> Vec<PeerRecord> {
        if let Some(idx) = self.bucket_index(target) {
            self.buckets[idx].last_access = now;
        }
        let mut peers: Vec<PeerRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        peers.sort_by(|a, b| {
            target
                .distance(&a.node_id())
                .cmp(&target.distance(&b.node_id()))
                .then_with(|| {
                    a.uuid
                        .hyphenated()
                        .to_string()
                        .cmp(&b.uuid.hyphenated().to_string())
                })
        });
        peers.truncate(n);
        peers
    }

    /// Every peer currently in the table.
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }

    /// Up to `n` peers sampled uniformly at random (liveness probing).
    pub fn random_sample(&self, n: usize, rng: &mut impl Rng) -> Vec<PeerRecord> {
        let mut peers = self.all_peers();
        // Partial Fisher-Yates: only the prefix we return needs shuffling.
        let take = n.min(peers.len());
        for i in 0..take {
            let j = rng.gen_range(i..peers.len());
            peers.swap(i, j);
        }
        peers.truncate(take);
        peers
    }

    /// Indexes of non-empty buckets whose last access is older than `max_age`.
    pub fn stale_buckets(&self, max_age_secs: u64, now: u64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.entries.is_empty() && now.saturating_sub(b.last_access) > max_age_secs
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// A random ID that falls into bucket `idx` (for refresh lookups).
    pub fn random_id_in_bucket(&self, idx: usize, rng: &mut impl Rng) -> NodeId {
        let prefix_len = ID_BITS - idx - 1;
        let mut id = [0u8; 16];
        rng.fill(&mut id[..]);
        // Copy the shared prefix from the local ID, then force a differing
        // bit right after it so the shared prefix length is exact.
        for bit in 0..prefix_len {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            id[byte] = (id[byte] & !mask) | (self.local_id.0[byte] & mask);
        }
        let byte = prefix_len / 8;
        let mask = 0x80u8 >> (prefix_len % 8);
        id[byte] = (id[byte] & !mask) | (!self.local_id.0[byte] & mask);
        NodeId(id)
    }

    /// Table statistics for status reporting.
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            peers: self.len(),
            buckets_used: self.buckets.iter().filter(|b| !b.entries.is_empty()).count(),
            k: self.k,
            max_peers: self.max_peers,
        }
    }
}

/// Routing table statistics
#[derive(Clone, Debug)]
pub struct RoutingStats {
    pub peers: usize,
    pub buckets_used: usize,
    pub k: usize,
    pub max_peers: usize,
}
