//! Bootstrap: rejoin or join the galaxy
//!
//! Ordered strategy ladder: cached peers → explicit peer → seed discovery →
//! completion (bulk sync or self-lookup, then ANNOUNCE to the K closest).
//! Failures never abort the process; with isolated mode on and nobody
//! reachable the node self-promotes to genesis.

use crate::lookup;
use crate::node::Node;
use std::sync::Arc;
use stellar_core::error::Result;
use stellar_core::types::{unix_now, NodeId, PeerRecord};
use tracing::{debug, info, warn};

/// Initial contacts attempted per seed listing.
const MAX_SEED_CANDIDATES: usize = 3;
/// Random bucket refreshes run during completion.
const COMPLETION_REFRESHES: usize = 2;

/// How bootstrap left the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// At least one peer verified; the routing table is seeded.
    Joined,
    /// Nobody reachable; waiting for inbound contact.
    Isolated,
    /// Nobody reachable and isolated mode on; now the genesis system.
    Genesis,
}

/// Run the full bootstrap ladder.
pub async fn run(
    node: &Arc<Node>,
    bootstrap_peer: Option<&str>,
    seeds: &[String],
) -> Result<BootstrapOutcome> {
    let mut verified = cached_rejoin(node).await;

    if verified == 0 {
        if let Some(addr) = bootstrap_peer {
            verified = explicit_peer(node, addr).await;
        }
    }

    if verified == 0 && !seeds.is_empty() {
        verified = seed_discovery(node, seeds).await;
    }

    if verified == 0 {
        if node.isolated_mode {
            node.promote_to_genesis()?;
            info!("no galaxy found; elected genesis");
            return Ok(BootstrapOutcome::Genesis);
        }
        info!("no galaxy found; running isolated until a peer makes contact");
        return Ok(BootstrapOutcome::Isolated);
    }

    complete(node).await;
    info!(peers = node.routing.read().len(), "bootstrap complete");
    Ok(BootstrapOutcome::Joined)
}

/// Strategy 1: PING everything in the persisted routing table.
async fn cached_rejoin(node: &Arc<Node>) -> usize {
    let cached = match node.store.get_all_peer_systems() {
        Ok(peers) => peers,
        Err(e) => {
            warn!("cached peer load failed: {e}");
            return 0;
        }
    };
    if cached.is_empty() {
        return 0;
    }
    info!(count = cached.len(), "attempting cached rejoin");

    // Seed the cache first so sponsor positions resolve during validation.
    {
        let now = unix_now();
        let mut cache = node.cache.write();
        for peer in &cached {
            cache.observe_rumor(peer.clone(), None, now);
        }
    }

    let mut verified = 0;
    for peer in cached {
        match node.ping(&peer.peer_address, peer.uuid).await {
            Ok(sys) => {
                if node.insert_verified_peer(&sys).await.is_ok() {
                    verified += 1;
                }
            }
            Err(e) => debug!(peer = %peer.uuid, "cached peer unreachable: {e}"),
        }
    }
    verified
}

/// Strategy 2: the operator-supplied peer, contacted over the side channel
/// first so we can derive sponsor and clustered coordinates before pinging.
async fn explicit_peer(node: &Arc<Node>, addr: &str) -> usize {
    info!(addr, "contacting bootstrap peer");
    let sys = match node.client.get_system(addr).await {
        Ok(sys) => sys,
        Err(e) => {
            warn!(addr, "bootstrap peer identity fetch failed: {e}");
            return 0;
        }
    };
    if sys.uuid == node.self_uuid() {
        warn!(addr, "bootstrap peer is ourselves; ignoring");
        return 0;
    }
    node.maybe_adopt_sponsor(sys.uuid, &sys.coordinates);

    match node.ping(addr, sys.uuid).await {
        Ok(sys) => {
            if node.insert_verified_peer(&sys).await.is_ok() {
                1
            } else {
                0
            }
        }
        Err(e) => {
            warn!(addr, "bootstrap peer unreachable: {e}");
            0
        }
    }
}

/// Strategy 3: walk the seed listings, pick a sponsor, contact up to three
/// candidates that advertise capacity.
async fn seed_discovery(node: &Arc<Node>, seeds: &[String]) -> usize {
    for seed in seeds {
        let listing = match node.client.get_discovery(seed).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!(seed, "seed discovery failed: {e}");
                continue;
            }
        };

        let self_uuid = node.self_uuid();
        let candidates: Vec<_> = listing
            .into_iter()
            .filter(|entry| entry.has_capacity && entry.id != self_uuid)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let sponsor = &candidates[0];
        node.maybe_adopt_sponsor(
            sponsor.id,
            &stellar_core::types::Coordinates::new(sponsor.x, sponsor.y, sponsor.z),
        );

        let mut verified = 0;
        for entry in candidates.iter().take(MAX_SEED_CANDIDATES) {
            match node.ping(&entry.peer_address, entry.id).await {
                Ok(sys) => {
                    if node.insert_verified_peer(&sys).await.is_ok() {
                        verified += 1;
                    }
                }
                Err(e) => debug!(peer = %entry.id, "seed candidate unreachable: {e}"),
            }
        }
        if verified > 0 {
            return verified;
        }
    }
    0
}

/// Step 4: learn the neighborhood. Bulk-sync when a peer offers it, iterative
/// self-lookup plus a couple of random refreshes otherwise, then ANNOUNCE to
/// the K closest.
async fn complete(node: &Arc<Node>) {
    let peers = node.routing.read().all_peers();

    let mut synced = false;
    if let Some(peer) = peers.first() {
        match node.client.get_full_sync(&peer.peer_address).await {
            Ok(systems) => {
                let now = unix_now();
                let self_uuid = node.self_uuid();
                let mut cache = node.cache.write();
                for sys in &systems {
                    if sys.uuid != self_uuid {
                        cache.observe_rumor(PeerRecord::from_system(sys), Some(peer.uuid), now);
                    }
                }
                info!(count = systems.len(), "bulk sync merged");
                synced = true;
            }
            Err(e) => debug!(peer = %peer.uuid, "full sync unavailable: {e}"),
        }
    }

    let self_id = node.self_node_id();
    if let Err(e) = lookup::iterative_find_node(node, self_id).await {
        debug!("self lookup failed: {e}");
    }
    if !synced {
        let mut rng = rand::thread_rng();
        for _ in 0..COMPLETION_REFRESHES {
            let target = NodeId(rand::Rng::gen(&mut rng));
            if let Err(e) = lookup::iterative_find_node(node, target).await {
                debug!("refresh lookup failed: {e}");
            }
        }
    }

    let k = node.k();
    let closest = node.routing.write().closest(&self_id, k, unix_now());
    for peer in closest {
        if let Err(e) = node.announce(&peer.peer_address, peer.uuid).await {
            debug!(peer = %peer.uuid, "announce failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Store;
    use clap::Parser;
    use stellar_core::identity::{Identity, UuidMode};
    use stellar_core::types::StarClass;
    use tempfile::tempdir;

    fn test_node(dir: &std::path::Path, isolated: bool) -> Arc<Node> {
        let mut args = vec![
            "stellard".to_string(),
            "--name".into(),
            "Bootstrap Test".into(),
            "--data-dir".into(),
            dir.to_str().unwrap().into(),
        ];
        if isolated {
            args.push("--isolated".into());
        }
        let config = Config::parse_from(args);
        let identity = Identity::load_or_create(&config.identity_path(), &UuidMode::Random).unwrap();
        let store = Arc::new(Store::open(config.db_path()).unwrap());
        Node::new(&config, identity, store).unwrap()
    }

    #[tokio::test]
    async fn test_genesis_election() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), true);

        let outcome = run(&node, None, &[]).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Genesis);

        let sys = node.self_system();
        assert_eq!(sys.star.primary, StarClass::X);
        assert!(sys.coordinates.is_origin());
        assert_eq!(sys.sponsor_id, None);
        assert!(node.routing.read().is_empty());
    }

    #[tokio::test]
    async fn test_without_isolated_mode_stays_isolated() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), false);

        let outcome = run(&node, None, &[]).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Isolated);
        // No genesis self-promotion without the flag.
        assert_ne!(node.self_system().star.primary, StarClass::X);
    }

    #[tokio::test]
    async fn test_unreachable_strategies_fall_through() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), false);

        let seeds = vec!["127.0.0.1:1".to_string()];
        let outcome = run(&node, Some("127.0.0.1:1"), &seeds).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Isolated);
    }
}
