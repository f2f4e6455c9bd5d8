//! Hourly credit engine
//!
//! Samples the attestations stored since the last cycle, feeds them through
//! the pure scoring math, and persists the monotonic balance.

use crate::node::Node;
use stellar_core::credit::{run_cycle, CreditBalance, CycleInputs, CycleOutcome};
use stellar_core::error::Result;
use stellar_core::types::unix_now;

/// What one engine cycle produced.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub balance: CreditBalance,
}

/// Run one scoring cycle against current storage and routing state.
pub fn run_cycle_once(node: &Node) -> Result<CycleReport> {
    let now = unix_now();
    let uuid = node.self_uuid();
    let mut balance = node
        .store
        .get_credit_balance(&uuid)?
        .unwrap_or_else(|| CreditBalance::new(uuid, node.started_at));

    let window_start = balance.last_updated;
    let stored = node.store.all_attestations_since(window_start)?;
    let mut timestamps: Vec<u64> = stored.iter().map(|s| s.attestation.timestamp).collect();
    timestamps.sort_unstable();
    let sent = stored.iter().filter(|s| s.outbound).count() as u64;
    let received = stored.len() as u64 - sent;

    let inputs = CycleInputs {
        timestamps,
        window_start,
        window_end: now,
        peer_count: node.routing.read().len(),
        connectivity: node.cache.read().connectivity_estimates(),
        galaxy_size: node.cache.read().len() + 1,
        sent,
        received,
        longevity_start: balance.longevity_start,
    };
    let outcome = run_cycle(&inputs);

    balance.longevity_start = outcome.longevity_start;
    balance.apply_earned(outcome.earned, now);
    node.store.save_credit_balance(&balance)?;

    Ok(CycleReport { outcome, balance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Store;
    use clap::Parser;
    use std::sync::Arc;
    use stellar_core::attestation::{Attestation, MessageType};
    use stellar_core::identity::{Identity, KeyPair, UuidMode};
    use stellar_core::star;
    use stellar_core::types::{Coordinates, PeerRecord};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_node(dir: &std::path::Path) -> Arc<Node> {
        let config = Config::parse_from([
            "stellard",
            "--name",
            "Credit Test",
            "--data-dir",
            dir.to_str().unwrap(),
        ]);
        let identity = Identity::load_or_create(&config.identity_path(), &UuidMode::Random).unwrap();
        let store = Arc::new(Store::open(config.db_path()).unwrap());
        Node::new(&config, identity, store).unwrap()
    }

    fn seed_peer(node: &Node, n: u128) {
        let uuid = Uuid::from_u128(n);
        let record = PeerRecord {
            uuid,
            public_key: vec![0u8; 32],
            name: format!("Peer {n}"),
            star: star::composition_of(&uuid),
            coordinates: Coordinates::default(),
            peer_address: "127.0.0.1:1".into(),
            last_verified: unix_now(),
            fail_count: 0,
            info_version: 1,
            sponsor_id: None,
        };
        node.routing
            .write()
            .upsert_verified(record, unix_now())
            .unwrap();
    }

    fn seed_attestations(node: &Node, peer: u128, count: u64, spacing: u64) {
        let kp = KeyPair::from_seed(&[peer as u8; 32]);
        let base = unix_now().saturating_sub(count * spacing);
        for i in 0..count {
            let message_type = if i % 2 == 0 {
                MessageType::Ping
            } else {
                MessageType::PingResponse
            };
            let att = Attestation::sign(
                Uuid::from_u128(peer),
                node.self_uuid(),
                message_type,
                base + i * spacing,
                &kp,
            );
            node.store.save_attestation(&att).unwrap();
        }
    }

    #[tokio::test]
    async fn test_quiet_cycle_earns_nothing() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let report = run_cycle_once(&node).unwrap();
        assert_eq!(report.outcome.earned, 0.0);
        assert_eq!(report.balance.balance, 0);
    }

    #[tokio::test]
    async fn test_active_cycle_accrues_pending() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        seed_peer(&node, 2);

        // Force the window open an hour back, then fill it with traffic
        // dense enough to clear the expected rate for one peer.
        let mut balance = CreditBalance::new(node.self_uuid(), unix_now() - 3600);
        balance.longevity_start = unix_now() - 3600;
        node.store.save_credit_balance(&balance).unwrap();
        seed_attestations(&node, 2, 24, 150);

        let report = run_cycle_once(&node).unwrap();
        assert!(report.outcome.uptime_ratio >= 0.5);
        assert!(report.outcome.earned > 0.0);
        let total =
            report.balance.balance as f64 + report.balance.pending_credits;
        assert!(total > 0.0);

        // A second, quiet cycle never decreases the balance.
        let before = report.balance.balance;
        let report = run_cycle_once(&node).unwrap();
        assert!(report.balance.balance >= before);
    }

    #[tokio::test]
    async fn test_balance_survives_reload() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());

        let mut balance = CreditBalance::new(node.self_uuid(), unix_now());
        balance.apply_earned(0.7, unix_now());
        node.store.save_credit_balance(&balance).unwrap();

        let loaded = node
            .store
            .get_credit_balance(&node.self_uuid())
            .unwrap()
            .unwrap();
        assert!((loaded.pending_credits - 0.7).abs() < 1e-9);
    }
}
