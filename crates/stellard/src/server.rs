//! Inbound RPC server
//!
//! HTTP/1.1 with JSON bodies on the peer port: `POST /dht` switched on the
//! envelope type, `GET /system` for bootstrap identity disclosure, the
//! discovery and full-sync listings, and the operator status endpoints.
//! Client-caused rejects answer with their taxonomy status and are not
//! logged at error level.

use crate::node::Node;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use stellar_core::error::Error;
use stellar_core::types::{unix_now, System};
use stellar_core::version::PROTOCOL_VERSION;
use stellar_net::wire::{DiscoveryEntry, Envelope, RpcType, WireError};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Build the service router.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/dht", post(handle_dht))
        .route("/system", get(handle_system))
        .route("/api/discovery", get(handle_discovery))
        .route("/api/full-sync", get(handle_full_sync))
        .route("/api/status", get(handle_status))
        .route("/api/map", get(handle_map))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Serve until the shutdown broadcast fires.
pub async fn serve(node: Arc<Node>, listen: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("listening on {listen}");
    let mut shutdown_rx = node.subscribe_shutdown();
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}

/// Convert a taxonomy error into its HTTP reject.
fn reject(err: &Error) -> Response {
    let wire = WireError::from_error(err);
    if err.is_client_fault() {
        debug!(code = wire.code, "rpc rejected: {err}");
    } else {
        error!(code = wire.code, "rpc failed: {err}");
    }
    let status = StatusCode::from_u16(wire.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(wire)).into_response()
}

fn respond(node: &Node, request: &Envelope, closest: Option<Vec<System>>) -> Response {
    let attestation = node.attest(
        request.from_system.uuid,
        request.rpc.attestation_type(true),
    );
    let mut response = request.respond(node.self_system(), attestation);
    response.closest_nodes = closest;
    Json(response).into_response()
}

async fn handle_dht(
    State(node): State<Arc<Node>>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Response {
    let Json(envelope) = match payload {
        Ok(p) => p,
        Err(e) => return reject(&Error::InvalidMessage(e.to_string())),
    };
    if envelope.is_response {
        return reject(&Error::InvalidMessage("unexpected response envelope".into()));
    }

    let attestation = match node.validate_envelope(&envelope) {
        Ok(att) => att,
        Err(e) => return reject(&e),
    };
    node.record_attestation(&attestation);

    let sender = envelope.from_system.clone();
    match envelope.rpc {
        RpcType::Ping => {
            node.absorb_contact(&sender);
            respond(&node, &envelope, None)
        }
        RpcType::FindNode => {
            let target = match envelope.parse_target() {
                Ok(t) => t,
                Err(e) => return reject(&e),
            };
            node.absorb_contact(&sender);

            let k = node.k();
            let self_id = node.self_node_id();
            let mut systems: Vec<System> = {
                let mut routing = node.routing.write();
                routing
                    .closest(&target, k, unix_now())
                    .iter()
                    .filter(|p| p.uuid != sender.uuid)
                    .map(|p| p.to_system())
                    .collect()
            };
            // Never include ourselves unless the target is our own ID.
            if target == self_id {
                systems.push(node.self_system());
                systems.sort_by(|a, b| {
                    target
                        .distance(&a.node_id())
                        .cmp(&target.distance(&b.node_id()))
                });
                systems.truncate(k);
            }
            respond(&node, &envelope, Some(systems))
        }
        RpcType::Announce => match node.insert_verified_peer(&sender).await {
            Ok(()) => {
                node.absorb_contact(&sender);
                respond(&node, &envelope, None)
            }
            Err(e) => reject(&e),
        },
    }
}

async fn handle_system(State(node): State<Arc<Node>>) -> Json<System> {
    Json(node.self_system())
}

async fn handle_discovery(State(node): State<Arc<Node>>) -> Json<Vec<DiscoveryEntry>> {
    let sys = node.self_system();
    let mut listing = vec![DiscoveryEntry {
        id: sys.uuid,
        name: sys.name.clone(),
        x: sys.coordinates.x,
        y: sys.coordinates.y,
        z: sys.coordinates.z,
        peer_address: sys.peer_address.clone(),
        has_capacity: !node.routing.read().at_capacity(),
    }];
    for entry in node.cache.read().snapshot() {
        if !entry.verified {
            continue;
        }
        let record = &entry.record;
        listing.push(DiscoveryEntry {
            id: record.uuid,
            name: record.name.clone(),
            x: record.coordinates.x,
            y: record.coordinates.y,
            z: record.coordinates.z,
            peer_address: record.peer_address.clone(),
            has_capacity: entry.referrers.len() < record.star.capacity(),
        });
    }
    Json(listing)
}

async fn handle_full_sync(State(node): State<Arc<Node>>) -> Json<Vec<System>> {
    let mut systems = vec![node.self_system()];
    for entry in node.cache.read().snapshot() {
        systems.push(entry.record.to_system());
    }
    Json(systems)
}

/// Operator status summary.
#[derive(Serialize)]
struct StatusSummary {
    uuid: String,
    name: String,
    star_class: String,
    coordinates: [f64; 3],
    peers: usize,
    cached_systems: usize,
    connectivity: String,
    credit_balance: u64,
    pending_credits: f64,
    rank: String,
    uptime_secs: u64,
    protocol: &'static str,
}

async fn handle_status(State(node): State<Arc<Node>>) -> Json<StatusSummary> {
    let sys = node.self_system();
    let balance = node
        .store
        .get_credit_balance(&sys.uuid)
        .ok()
        .flatten();
    Json(StatusSummary {
        uuid: sys.uuid.hyphenated().to_string(),
        name: sys.name,
        star_class: sys.star.primary.to_string(),
        coordinates: [sys.coordinates.x, sys.coordinates.y, sys.coordinates.z],
        peers: node.routing.read().len(),
        cached_systems: node.cache.read().len(),
        connectivity: node.connectivity().to_string(),
        credit_balance: balance.as_ref().map(|b| b.balance).unwrap_or(0),
        pending_credits: balance.as_ref().map(|b| b.pending_credits).unwrap_or(0.0),
        rank: balance
            .as_ref()
            .map(|b| b.rank().to_string())
            .unwrap_or_else(|| "Unranked".into()),
        uptime_secs: unix_now().saturating_sub(node.started_at),
        protocol: PROTOCOL_VERSION,
    })
}

/// One dot on the galaxy map.
#[derive(Serialize)]
struct MapEntry {
    id: String,
    name: String,
    star_class: String,
    x: f64,
    y: f64,
    z: f64,
    verified: bool,
}

async fn handle_map(State(node): State<Arc<Node>>) -> Json<Vec<MapEntry>> {
    let sys = node.self_system();
    let mut entries = vec![MapEntry {
        id: sys.uuid.hyphenated().to_string(),
        name: sys.name,
        star_class: sys.star.primary.to_string(),
        x: sys.coordinates.x,
        y: sys.coordinates.y,
        z: sys.coordinates.z,
        verified: true,
    }];
    for entry in node.cache.read().snapshot() {
        let record = &entry.record;
        entries.push(MapEntry {
            id: record.uuid.hyphenated().to_string(),
            name: record.name.clone(),
            star_class: record.star.primary.to_string(),
            x: record.coordinates.x,
            y: record.coordinates.y,
            z: record.coordinates.z,
            verified: entry.verified,
        });
    }
    Json(entries)
}

async fn handle_not_found() -> Response {
    reject(&Error::NotFound("unknown endpoint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Store;
    use clap::Parser;
    use stellar_core::attestation::{Attestation, MessageType};
    use stellar_core::identity::{Identity, KeyPair, UuidMode};
    use stellar_core::star;
    use stellar_core::types::{Coordinates, NodeId};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_node(dir: &std::path::Path) -> Arc<Node> {
        let config = Config::parse_from([
            "stellard",
            "--name",
            "Server Test",
            "--data-dir",
            dir.to_str().unwrap(),
        ]);
        let identity = Identity::load_or_create(&config.identity_path(), &UuidMode::Random).unwrap();
        let store = Arc::new(Store::open(config.db_path()).unwrap());
        Node::new(&config, identity, store).unwrap()
    }

    fn remote(n: u128, kp: &KeyPair) -> System {
        let uuid = Uuid::from_u128(n);
        System {
            uuid,
            name: format!("Remote {n}"),
            star: star::composition_of(&uuid),
            coordinates: Coordinates::new(5.0, 5.0, 5.0),
            sponsor_id: None,
            public_key: kp.public_key().to_vec(),
            peer_address: "127.0.0.1:1".into(),
            info_version: 1,
            last_seen: unix_now(),
        }
    }

    fn request(node: &Node, rpc: RpcType, sys: &System, kp: &KeyPair) -> Envelope {
        let att = Attestation::sign(
            sys.uuid,
            node.self_uuid(),
            rpc.attestation_type(false),
            unix_now(),
            kp,
        );
        Envelope::request(rpc, sys.clone(), att)
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let sys = remote(80, &kp);

        let env = request(&node, RpcType::Ping, &sys, &kp);
        let response = handle_dht(State(node.clone()), Ok(Json(env))).await;
        assert_eq!(response.status(), StatusCode::OK);

        // The sender is cached as verified and its attestation stored.
        assert!(node.cache.read().get(&sys.uuid).unwrap().verified);
        assert_eq!(node.store.get_attestations(&sys.uuid).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_ping_gets_402() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let sys = remote(80, &kp);

        let mut env = request(&node, RpcType::Ping, &sys, &kp);
        env.attestation.as_mut().unwrap().signature[10] ^= 0x04;
        let response = handle_dht(State(node.clone()), Ok(Json(env))).await;
        assert_eq!(response.status().as_u16(), 402);
        // Nothing was stored for the rejected message.
        assert!(node.store.get_attestations(&sys.uuid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_attestation_gets_401() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let sys = remote(80, &kp);

        let mut env = request(&node, RpcType::Ping, &sys, &kp);
        env.attestation = None;
        let response = handle_dht(State(node), Ok(Json(env))).await;
        assert_eq!(response.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn test_announce_registers_sender() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let sys = remote(80, &kp);

        let env = request(&node, RpcType::Announce, &sys, &kp);
        let response = handle_dht(State(node.clone()), Ok(Json(env))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(node.routing.read().contains(&sys.uuid));
    }

    #[tokio::test]
    async fn test_find_node_sorted_and_capped() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);

        for n in 100..140u128 {
            let sys = remote(n, &kp);
            let env = request(&node, RpcType::Announce, &sys, &kp);
            handle_dht(State(node.clone()), Ok(Json(env))).await;
        }

        let caller = remote(99, &kp);
        let target = NodeId::from_uuid(&Uuid::from_u128(123));
        let env = request(&node, RpcType::FindNode, &caller, &kp).with_target(target);
        let response = handle_dht(State(node.clone()), Ok(Json(env))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Envelope = serde_json::from_slice(&bytes).unwrap();
        let nodes = parsed.closest_nodes.unwrap();
        assert!(!nodes.is_empty());
        assert!(nodes.len() <= node.k());
        // Sorted ascending by XOR distance and never includes the responder.
        for pair in nodes.windows(2) {
            assert!(
                target.distance(&pair[0].node_id()) <= target.distance(&pair[1].node_id())
            );
        }
        assert!(nodes.iter().all(|s| s.uuid != node.self_uuid()));
    }

    #[tokio::test]
    async fn test_find_node_includes_self_for_own_id() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);

        let caller = remote(99, &kp);
        let env =
            request(&node, RpcType::FindNode, &caller, &kp).with_target(node.self_node_id());
        let response = handle_dht(State(node.clone()), Ok(Json(env))).await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Envelope = serde_json::from_slice(&bytes).unwrap();
        let nodes = parsed.closest_nodes.unwrap();
        assert!(nodes.iter().any(|s| s.uuid == node.self_uuid()));
    }

    #[tokio::test]
    async fn test_response_envelope_rejected() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let sys = remote(80, &kp);

        let mut env = request(&node, RpcType::Ping, &sys, &kp);
        env.is_response = true;
        let response = handle_dht(State(node), Ok(Json(env))).await;
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_discovery_lists_self() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path());
        let Json(listing) = handle_discovery(State(node.clone())).await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, node.self_uuid());
        assert!(listing[0].has_capacity);
    }

    #[tokio::test]
    async fn test_not_found_payload() {
        let response = handle_not_found().await;
        assert_eq!(response.status().as_u16(), 404);
    }
}
