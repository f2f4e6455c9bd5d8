//! Stellar Lab Core Library
//!
//! This crate provides the core types, deterministic derivations, and
//! cryptographic primitives for the Stellar Lab galaxy protocol.
//!
//! # Modules
//!
//! - [`types`]: Core protocol types (NodeId, StarClass, System, PeerRecord)
//! - [`identity`]: Stable UUID derivation and Ed25519 keypair management
//! - [`star`]: Deterministic star composition and galactic coordinates
//! - [`attestation`]: Canonical signing bytes and attestation verification
//! - [`credit`]: Longevity accounting, bonuses, and rank tables
//! - [`version`]: Protocol version parsing and compatibility
//! - [`error`]: Error taxonomy shared with the RPC layer

pub mod attestation;
pub mod credit;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod star;
pub mod types;
pub mod version;

pub use error::{Error, Result};
pub use types::*;
