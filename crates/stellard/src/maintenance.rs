//! Periodic maintenance loops
//!
//! Six cooperative tasks keep the routing invariants: announce, bucket
//! refresh, liveness sampling, gossip validation, cache pruning, and the
//! hourly credit cycle, plus the daily attestation compaction at 03:00
//! local. Every loop selects on (ticker, shutdown) and bounds its per-tick
//! work.

use crate::credit;
use crate::lookup;
use crate::node::{Node, F_MAX};
use chrono::{Datelike, Local, Timelike};
use std::sync::Arc;
use std::time::Duration;
use stellar_core::types::unix_now;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Re-announce to the K closest every 30 minutes.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Refresh stale buckets every 60 minutes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// A bucket untouched this long gets a refresh lookup.
pub const REFRESH_BUCKET_MAX_AGE_SECS: u64 = 3600;
/// Refresh lookups per tick.
const REFRESH_LOOKUPS_PER_TICK: usize = 4;
/// Liveness sampling every 5 minutes.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Peers probed per liveness cycle.
pub const LIVENESS_SAMPLE_MAX: usize = 50;
/// Gossip validation every 10 minutes.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Rumors probed per gossip tick.
const GOSSIP_BATCH: usize = 20;
/// Direct-contact failures before a never-verified rumor is dropped.
const GHOST_PROBE_LIMIT: u32 = 3;
/// Cache pruning every 6 hours.
pub const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(6 * 3600);
/// Entries unverified this long are expired.
pub const CACHE_MAX_AGE_SECS: u64 = 24 * 3600;
/// Raw attestations older than this are compacted into summaries.
pub const RAW_RETAIN_SECS: u64 = 24 * 3600;
/// Local hour at which compaction runs.
const COMPACT_HOUR: u32 = 3;
/// Raw rows consumed per compaction pass.
const COMPACT_MAX_ROWS: usize = 10_000;
/// Credit engine cycle length.
pub const CREDIT_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn every maintenance loop. Each exits on the shutdown broadcast.
pub fn spawn_all(node: &Arc<Node>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop("announce", node.clone(), ANNOUNCE_INTERVAL, announce_tick),
        spawn_loop("refresh", node.clone(), REFRESH_INTERVAL, refresh_tick),
        spawn_loop("liveness", node.clone(), LIVENESS_INTERVAL, liveness_tick),
        spawn_loop("gossip", node.clone(), GOSSIP_INTERVAL, gossip_tick),
        spawn_loop("cache-prune", node.clone(), CACHE_PRUNE_INTERVAL, cache_prune_tick),
        spawn_loop("credit", node.clone(), CREDIT_INTERVAL, credit_tick),
        spawn_compaction(node.clone()),
    ]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    node: Arc<Node>,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Node>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut shutdown_rx = node.subscribe_shutdown();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(task = name, "maintenance tick");
                    tick(node.clone()).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!(task = name, "maintenance loop stopped");
                    break;
                }
            }
        }
    })
}

/// Re-ANNOUNCE to the K closest systems to ourselves.
async fn announce_tick(node: Arc<Node>) {
    let self_id = node.self_node_id();
    let k = node.k();
    let closest = node.routing.write().closest(&self_id, k, unix_now());
    for peer in closest {
        if let Err(e) = node.announce(&peer.peer_address, peer.uuid).await {
            debug!(peer = %peer.uuid, "announce failed: {e}");
        }
    }
}

/// FIND_NODE on a random ID inside every stale, non-empty bucket.
async fn refresh_tick(node: Arc<Node>) {
    let targets: Vec<_> = {
        let routing = node.routing.read();
        let mut rng = rand::thread_rng();
        routing
            .stale_buckets(REFRESH_BUCKET_MAX_AGE_SECS, unix_now())
            .into_iter()
            .take(REFRESH_LOOKUPS_PER_TICK)
            .map(|idx| routing.random_id_in_bucket(idx, &mut rng))
            .collect()
    };
    for target in targets {
        if let Err(e) = lookup::iterative_find_node(&node, target).await {
            debug!("refresh lookup failed: {e}");
        }
    }
}

/// PING + ANNOUNCE a bounded random sample; eviction at F_MAX rides on the
/// failure marking inside the RPC path.
async fn liveness_tick(node: Arc<Node>) {
    let sample = {
        let routing = node.routing.read();
        let mut rng = rand::thread_rng();
        routing.random_sample(LIVENESS_SAMPLE_MAX, &mut rng)
    };
    let mut alive = 0usize;
    let total = sample.len();
    for peer in sample {
        match node.ping(&peer.peer_address, peer.uuid).await {
            Ok(_) => {
                alive += 1;
                if let Err(e) = node.announce(&peer.peer_address, peer.uuid).await {
                    debug!(peer = %peer.uuid, "liveness announce failed: {e}");
                }
            }
            Err(e) => debug!(peer = %peer.uuid, "liveness ping failed: {e}"),
        }
    }
    if total > 0 {
        info!(alive, probed = total, status = %node.connectivity(), "liveness cycle");
    }
}

/// Attempt direct contact with rumored systems; drop ghosts that never
/// answer anybody.
async fn gossip_tick(node: Arc<Node>) {
    let rumors = node.cache.read().unverified(GOSSIP_BATCH);
    for record in rumors {
        match node.ping(&record.peer_address, record.uuid).await {
            Ok(sys) => {
                if let Err(e) = node.insert_verified_peer(&sys).await {
                    debug!(peer = %sys.uuid, "verified rumor not inserted: {e}");
                }
            }
            Err(e) => {
                debug!(peer = %record.uuid, "rumor unreachable: {e}");
                let failures = node
                    .cache
                    .read()
                    .get(&record.uuid)
                    .map(|entry| entry.probe_failures)
                    .unwrap_or(0);
                if failures >= GHOST_PROBE_LIMIT {
                    node.cache.write().remove(&record.uuid);
                    info!(peer = %record.uuid, "ghost system suppressed");
                }
            }
        }
    }
}

/// Expire stale cache entries and their persisted counterparts.
async fn cache_prune_tick(node: Arc<Node>) {
    let now = unix_now();
    let removed = node.cache.write().prune_expired(CACHE_MAX_AGE_SECS, now);
    for uuid in &removed {
        if let Err(e) = node.store.remove_peer_system(uuid) {
            warn!("peer removal failed: {e}");
        }
    }
    let store = &node.store;
    match (
        store.prune_peer_systems(CACHE_MAX_AGE_SECS, now),
        store.prune_peer_connections(CACHE_MAX_AGE_SECS, now),
        store.prune_dead_peers(F_MAX),
    ) {
        (Ok(systems), Ok(connections), Ok(dead)) => {
            if !removed.is_empty() || systems + connections + dead > 0 {
                info!(
                    cache = removed.len(),
                    systems, connections, dead, "cache prune cycle"
                );
            }
        }
        (a, b, c) => {
            for err in [a.err(), b.err(), c.err()].into_iter().flatten() {
                warn!("prune failed: {err}");
            }
        }
    }
}

/// Hourly credit engine cycle.
async fn credit_tick(node: Arc<Node>) {
    match credit::run_cycle_once(&node) {
        Ok(report) => info!(
            earned = report.outcome.earned,
            balance = report.balance.balance,
            rank = %report.balance.rank(),
            "credit cycle"
        ),
        Err(e) => warn!("credit cycle failed: {e}"),
    }
}

/// Daily compaction at 03:00 local: a one-minute gate so the loop itself
/// stays cheap, with bounded passes until the backlog drains.
fn spawn_compaction(node: Arc<Node>) -> JoinHandle<()> {
    let mut shutdown_rx = node.subscribe_shutdown();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_run_day: Option<i32> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let local = Local::now();
                    let today = local.num_days_from_ce();
                    if local.hour() != COMPACT_HOUR || last_run_day == Some(today) {
                        continue;
                    }
                    last_run_day = Some(today);
                    let cutoff = unix_now().saturating_sub(RAW_RETAIN_SECS);
                    let mut total_deleted = 0usize;
                    loop {
                        match node.store.compact_attestations(cutoff, COMPACT_MAX_ROWS) {
                            Ok(stats) => {
                                total_deleted += stats.rows_deleted;
                                if stats.rows_deleted < COMPACT_MAX_ROWS {
                                    break;
                                }
                                // Yield between passes so other tasks run.
                                tokio::task::yield_now().await;
                            }
                            Err(e) => {
                                warn!("compaction failed: {e}");
                                break;
                            }
                        }
                    }
                    if total_deleted > 0 {
                        info!(rows = total_deleted, "attestation compaction complete");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
