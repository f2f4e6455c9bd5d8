//! stellard - Stellar Lab galaxy node daemon
//!
//! Boot order: identity and keys, then the local star record, then storage,
//! then the wire server; bootstrap populates the routing table and the
//! maintenance loops keep it correct until shutdown.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use stellar_core::identity::Identity;
use stellard::config::Config;
use stellard::node::Node;
use stellard::storage::Store;
use stellard::{bootstrap, maintenance, server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env().add_directive("stellard=info".parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("stellard v{} - Stellar Lab Galaxy Node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let identity = match Identity::load_or_create(&config.identity_path(), &config.uuid_mode()) {
        Ok(identity) => identity,
        Err(e) => {
            error!("identity setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match Store::open(config.db_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("storage open failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::new(&config, identity, store) {
        Ok(node) => node,
        Err(e) => {
            error!("node init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    {
        let sys = node.self_system();
        info!(
            uuid = %sys.uuid,
            name = %sys.name,
            class = %sys.star.primary,
            "local system loaded"
        );
    }

    let server_handle = {
        let node = node.clone();
        let listen = config.listen;
        tokio::spawn(async move {
            if let Err(e) = server::serve(node, listen).await {
                error!("server error: {e}");
            }
        })
    };

    match bootstrap::run(&node, config.bootstrap_peer.as_deref(), &config.seeds).await {
        Ok(outcome) => info!(?outcome, status = %node.connectivity(), "bootstrap finished"),
        Err(e) => error!("bootstrap error: {e}"),
    }

    let maintenance_handles = maintenance::spawn_all(&node);

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");
    node.trigger_shutdown();

    for handle in maintenance_handles {
        let _ = handle.await;
    }
    let _ = server_handle.await;

    // Storage closes last.
    if let Err(e) = node.store.flush() {
        error!("final flush failed: {e}");
        return ExitCode::FAILURE;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}
