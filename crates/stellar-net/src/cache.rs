//! Observed-system cache
//!
//! A bounded map of every system ever observed, verified or rumored. It
//! feeds the map view, gossip validation, and the connectivity estimates
//! behind the bridge bonus. Entries that were never re-verified expire.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use stellar_core::types::PeerRecord;
use uuid::Uuid;

/// Referrers tracked per entry before the set stops growing.
const MAX_REFERRERS: usize = 64;

/// One cached system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedSystem {
    pub record: PeerRecord,
    /// True once we have spoken to the system directly.
    pub verified: bool,
    pub first_seen: u64,
    pub last_verified: u64,
    /// Direct-contact failures for gossip validation of rumors.
    pub probe_failures: u32,
    /// Distinct peers whose FIND_NODE responses mentioned this system.
    /// The count estimates the system's connectivity.
    pub referrers: HashSet<Uuid>,
}

/// Bounded cache of all observed systems, keyed by UUID.
pub struct SystemCache {
    entries: HashMap<Uuid, CachedSystem>,
    max_entries: usize,
}

impl SystemCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    /// Record a system we spoke to directly.
    pub fn observe_verified(&mut self, record: PeerRecord, now: u64) {
        match self.entries.get_mut(&record.uuid) {
            Some(entry) => {
                entry.record.absorb(&record.to_system());
                entry.verified = true;
                entry.last_verified = now;
                entry.probe_failures = 0;
            }
            None => {
                self.make_room(now);
                self.entries.insert(
                    record.uuid,
                    CachedSystem {
                        record,
                        verified: true,
                        first_seen: now,
                        last_verified: now,
                        probe_failures: 0,
                        referrers: HashSet::new(),
                    },
                );
            }
        }
    }

    /// Record a system heard about through gossip. `via` is the peer whose
    /// response mentioned it.
    pub fn observe_rumor(&mut self, record: PeerRecord, via: Option<Uuid>, now: u64) {
        match self.entries.get_mut(&record.uuid) {
            Some(entry) => {
                entry.record.absorb(&record.to_system());
                if let Some(via) = via {
                    if entry.referrers.len() < MAX_REFERRERS {
                        entry.referrers.insert(via);
                    }
                }
            }
            None => {
                self.make_room(now);
                let mut referrers = HashSet::new();
                if let Some(via) = via {
                    referrers.insert(via);
                }
                self.entries.insert(
                    record.uuid,
                    CachedSystem {
                        record,
                        verified: false,
                        first_seen: now,
                        last_verified: 0,
                        probe_failures: 0,
                        referrers,
                    },
                );
            }
        }
    }

    pub fn mark_verified(&mut self, uuid: &Uuid, now: u64) {
        if let Some(entry) = self.entries.get_mut(uuid) {
            entry.verified = true;
            entry.last_verified = now;
            entry.probe_failures = 0;
        }
    }

    /// Record a failed direct-contact attempt; returns the new failure count.
    pub fn mark_probe_failed(&mut self, uuid: &Uuid) -> u32 {
        match self.entries.get_mut(uuid) {
            Some(entry) => {
                entry.probe_failures += 1;
                entry.probe_failures
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<CachedSystem> {
        self.entries.remove(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&CachedSystem> {
        self.entries.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries never verified directly, oldest rumors first.
    pub fn unverified(&self, limit: usize) -> Vec<PeerRecord> {
        let mut rumors: Vec<&CachedSystem> =
            self.entries.values().filter(|e| !e.verified).collect();
        rumors.sort_by_key(|e| e.first_seen);
        rumors
            .into_iter()
            .take(limit)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Drop entries not re-verified within `max_age`. Rumors age from first
    /// sighting, verified entries from their last verification.
    pub fn prune_expired(&mut self, max_age_secs: u64, now: u64) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                let reference = if e.verified { e.last_verified } else { e.first_seen };
                now.saturating_sub(reference) > max_age_secs
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Connectivity estimates for the bridge score.
    pub fn connectivity_estimates(&self) -> Vec<u32> {
        self.entries
            .values()
            .map(|e| e.referrers.len() as u32)
            .collect()
    }

    /// Full snapshot for the map view and full-sync responses.
    pub fn snapshot(&self) -> Vec<CachedSystem> {
        self.entries.values().cloned().collect()
    }

    /// When full, drop the oldest unverified entry to admit a new one.
    fn make_room(&mut self, _now: u64) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let oldest_rumor = self
            .entries
            .values()
            .filter(|e| !e.verified)
            .min_by_key(|e| e.first_seen)
            .map(|e| e.record.uuid);
        if let Some(uuid) = oldest_rumor {
            self.entries.remove(&uuid);
        }
    }
}
