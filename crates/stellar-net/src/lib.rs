//! Networking primitives for the Stellar Lab galaxy protocol
//!
//! This crate provides:
//! - Wire envelopes for the PING / FIND_NODE / ANNOUNCE RPC pairs
//! - The 128-bit XOR routing table with class-sized k-buckets
//! - The observed-system cache used for gossip validation and the map
//! - The outbound HTTP RPC client

pub mod cache;
pub mod client;
pub mod routing;
pub mod wire;

pub use cache::{CachedSystem, SystemCache};
pub use client::{ClientError, RpcClient};
pub use routing::{InsertOutcome, RoutingTable};
pub use wire::{DiscoveryEntry, Envelope, RpcType, WireError};
