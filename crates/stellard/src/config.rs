//! Configuration for stellard

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use stellar_core::identity::UuidMode;

/// stellard - Stellar Lab Galaxy Node Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "stellard")]
#[command(about = "Stellar Lab galaxy node daemon")]
pub struct Config {
    /// Listen address for the peer HTTP port
    #[arg(short, long, default_value = "0.0.0.0:4477")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/stellard")]
    pub data_dir: PathBuf,

    /// Human-readable system name (1..64 printable characters)
    #[arg(long, env = "STELLAR_NAME")]
    pub name: String,

    /// Address other peers should dial, host:port (defaults to the listen address)
    #[arg(long, env = "STELLAR_PUBLIC_ADDRESS")]
    pub public_address: Option<String>,

    /// Bootstrap peer address, host:port
    #[arg(long)]
    pub bootstrap_peer: Option<String>,

    /// Seed discovery addresses (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Allow genesis self-promotion when no peer is reachable
    #[arg(long)]
    pub isolated: bool,

    /// Derive the system UUID from this seed instead of the hardware alone
    #[arg(long, env = "STELLAR_UUID_SEED")]
    pub uuid_seed: Option<String>,

    /// Use a fresh random UUID, ignoring the hardware fingerprint
    #[arg(long)]
    pub random_identity: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        stellar_core::types::validate_name(&self.name)
            .map_err(|e| anyhow::anyhow!("invalid --name: {e}"))?;
        if self.uuid_seed.is_some() && self.random_identity {
            anyhow::bail!("--uuid-seed and --random-identity are mutually exclusive");
        }
        if let Some(peer) = &self.bootstrap_peer {
            if !peer.contains(':') {
                anyhow::bail!("--bootstrap-peer must be host:port, got {peer:?}");
            }
        }
        Ok(())
    }

    /// UUID derivation mode for first start.
    pub fn uuid_mode(&self) -> UuidMode {
        if self.random_identity {
            UuidMode::Random
        } else if let Some(seed) = &self.uuid_seed {
            UuidMode::Seeded(seed.clone())
        } else {
            UuidMode::Hardware
        }
    }

    /// The address advertised to peers.
    pub fn advertised_address(&self) -> String {
        self.public_address
            .clone()
            .unwrap_or_else(|| self.listen.to_string())
    }

    /// Path of the identity file inside the data directory.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    /// Path of the sled database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["stellard", "--name", "Test Reach"])
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised_address(), "0.0.0.0:4477");
        assert!(matches!(config.uuid_mode(), UuidMode::Hardware));
    }

    #[test]
    fn test_rejects_placeholder_name() {
        let config = Config::parse_from(["stellard", "--name", "unknown"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_and_random_exclusive() {
        let mut config = base();
        config.uuid_seed = Some("abc".into());
        config.random_identity = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bootstrap_peer_shape() {
        let mut config = base();
        config.bootstrap_peer = Some("not-an-address".into());
        assert!(config.validate().is_err());
        config.bootstrap_peer = Some("galaxy.example.net:4477".into());
        assert!(config.validate().is_ok());
    }
}
