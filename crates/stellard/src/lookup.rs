//! Iterative FIND_NODE lookup
//!
//! α-parallel convergence over a shortlist ordered by XOR distance. Each
//! round queries the α nearest unqueried candidates, merges what they return,
//! and stops once a round brings nothing closer than the K-th best known.

use crate::node::Node;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stellar_core::error::{Error, Result};
use stellar_core::types::{unix_now, NodeId, PeerRecord};
use tracing::debug;
use uuid::Uuid;

/// Fan-out width per round.
pub const ALPHA: usize = 3;

/// XOR distance of the K-th best entry, if the shortlist holds that many.
fn kth_distance(shortlist: &HashMap<Uuid, PeerRecord>, target: &NodeId, k: usize) -> Option<[u8; 16]> {
    if shortlist.len() < k {
        return None;
    }
    let mut distances: Vec<[u8; 16]> = shortlist
        .values()
        .map(|p| target.distance(&p.node_id()))
        .collect();
    distances.sort();
    distances.get(k - 1).copied()
}

fn sorted_candidates(
    shortlist: &HashMap<Uuid, PeerRecord>,
    queried: &HashSet<Uuid>,
    target: &NodeId,
    limit: usize,
) -> Vec<PeerRecord> {
    let mut candidates: Vec<PeerRecord> = shortlist
        .values()
        .filter(|p| !queried.contains(&p.uuid))
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
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
    candidates.truncate(limit);
    candidates
}

/// Produce the K closest verified nodes to `target`.
pub async fn iterative_find_node(node: &Arc<Node>, target: NodeId) -> Result<Vec<PeerRecord>> {
    let k = node.k();
    let now = unix_now();
    let self_uuid = node.self_uuid();

    let mut shortlist: HashMap<Uuid, PeerRecord> = HashMap::new();
    for peer in node.routing.write().closest(&target, k, now) {
        shortlist.insert(peer.uuid, peer);
    }
    if shortlist.len() < k {
        // Top up from the cache so rumored systems can be reached too.
        for entry in node.cache.read().snapshot() {
            if entry.record.uuid != self_uuid {
                shortlist.entry(entry.record.uuid).or_insert(entry.record);
            }
        }
    }

    let mut queried: HashSet<Uuid> = HashSet::new();
    let mut responded: HashSet<Uuid> = HashSet::new();
    let mut any_query_sent = false;

    loop {
        let candidates = sorted_candidates(&shortlist, &queried, &target, ALPHA);
        if candidates.is_empty() {
            break;
        }
        any_query_sent = true;
        let best_before = kth_distance(&shortlist, &target, k);

        let mut handles = Vec::with_capacity(candidates.len());
        for peer in candidates {
            queried.insert(peer.uuid);
            let node = Arc::clone(node);
            let addr = peer.peer_address.clone();
            let uuid = peer.uuid;
            handles.push((
                uuid,
                tokio::spawn(async move { node.find_node(&addr, uuid, target).await }),
            ));
        }

        let mut merged_closer = false;
        for (uuid, handle) in handles {
            match handle.await {
                Ok(Ok(systems)) => {
                    responded.insert(uuid);
                    for sys in systems {
                        if sys.uuid == self_uuid || shortlist.contains_key(&sys.uuid) {
                            continue;
                        }
                        let record = PeerRecord::from_system(&sys);
                        let closer = match best_before {
                            Some(kth) => target.distance(&record.node_id()) < kth,
                            None => true,
                        };
                        merged_closer |= closer;
                        shortlist.insert(sys.uuid, record);
                    }
                }
                Ok(Err(e)) => {
                    debug!(peer = %uuid, "lookup query failed: {e}");
                    shortlist.remove(&uuid);
                }
                Err(e) => {
                    debug!(peer = %uuid, "lookup task join failed: {e}");
                    shortlist.remove(&uuid);
                }
            }
        }

        if !merged_closer {
            break;
        }
    }

    // Only nodes that answered us, or that the table already verified, count.
    let routing = node.routing.read();
    let mut result: Vec<PeerRecord> = shortlist
        .into_values()
        .filter(|p| responded.contains(&p.uuid) || routing.contains(&p.uuid))
        .collect();
    drop(routing);

    if result.is_empty() {
        if any_query_sent {
            return Err(Error::LookupTimeout);
        }
        return Ok(Vec::new());
    }

    result.sort_by(|a, b| {
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
    result.truncate(k);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Store;
    use clap::Parser;
    use stellar_core::identity::{Identity, UuidMode};
    use stellar_core::star;
    use stellar_core::types::Coordinates;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path) -> Arc<Node> {
        let config = Config::parse_from([
            "stellard",
            "--name",
            "Lookup Test",
            "--data-dir",
            dir.to_str().unwrap(),
        ]);
        let identity = Identity::load_or_create(&config.identity_path(), &UuidMode::Random).unwrap();
        let store = Arc::new(Store::open(config.db_path()).unwrap());
        Node::new(&config, identity, store).unwrap()
    }

    fn unreachable_peer(n: u128) -> PeerRecord {
        let uuid = Uuid::from_u128(n);
        PeerRecord {
            uuid,
            public_key: vec![0u8; 32],
            name: format!("Dead {n}"),
            star: star::composition_of(&uuid),
            coordinates: Coordinates::default(),
            // Reserved port on localhost: refused immediately.
            peer_address: "127.0.0.1:1".into(),
            last_verified: unix_now(),
            fail_count: 0,
            info_version: 1,
            sponsor_id: None,
        }
    }

    #[tokio::test]
    async fn test_empty_table_returns_empty() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let target = NodeId::from_uuid(&Uuid::from_u128(42));
        let result = iterative_find_node(&node, target).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_all_peers_unreachable_times_out() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let now = unix_now();
        for n in 1..4u128 {
            node.routing
                .write()
                .upsert_verified(unreachable_peer(n), now)
                .unwrap();
        }
        let target = NodeId::from_uuid(&Uuid::from_u128(42));
        let err = iterative_find_node(&node, target).await.unwrap_err();
        assert!(matches!(err, Error::LookupTimeout));
    }

    #[test]
    fn test_kth_distance() {
        let target = NodeId([0u8; 16]);
        let mut shortlist = HashMap::new();
        assert!(kth_distance(&shortlist, &target, 2).is_none());
        for n in 1..4u128 {
            let peer = unreachable_peer(n);
            shortlist.insert(peer.uuid, peer);
        }
        let kth = kth_distance(&shortlist, &target, 2).unwrap();
        let mut all: Vec<[u8; 16]> = shortlist
            .values()
            .map(|p| target.distance(&p.node_id()))
            .collect();
        all.sort();
        assert_eq!(kth, all[1]);
    }
}
