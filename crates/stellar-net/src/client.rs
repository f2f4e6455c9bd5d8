//! Outbound HTTP RPC client
//!
//! All RPCs are JSON over HTTP/1.1, bounded by the RPC timeout on every path.
//! The client is mechanical: it ships envelopes and decodes replies; envelope
//! validation belongs to the caller.

use crate::wire::{DiscoveryEntry, Envelope, WireError};
use serde::de::DeserializeOwned;
use std::time::Duration;
use stellar_core::types::System;
use thiserror::Error;
use tracing::debug;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {addr} timed out")]
    Timeout { addr: String },
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("peer {addr} rejected with {code}: {message}")]
    Rejected {
        addr: String,
        code: u16,
        message: String,
    },
    #[error("malformed response from {addr}: {reason}")]
    Decode { addr: String, reason: String },
    #[error("client build failed: {0}")]
    Build(String),
}

impl ClientError {
    /// True when the peer answered but refused us (reject codes), as opposed
    /// to being unreachable.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected { .. })
    }

    /// The peer's routing table was full.
    pub fn is_at_capacity(&self) -> bool {
        matches!(self, ClientError::Rejected { code: 429, .. })
    }
}

/// Outbound RPC client with a shared connection pool.
pub struct RpcClient {
    http: reqwest::Client,
}

impl RpcClient {
    /// Build a client whose every request is bounded by `rpc_timeout`.
    pub fn new(rpc_timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;
        Ok(Self { http })
    }

    /// Send one DHT envelope and decode the response envelope.
    pub async fn send_dht(&self, addr: &str, envelope: &Envelope) -> Result<Envelope, ClientError> {
        let url = format!("http://{addr}/dht");
        debug!(addr, rpc = ?envelope.rpc, "outbound rpc");
        let response = self
            .http
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| Self::transport_error(addr, e))?;
        Self::decode(addr, response).await
    }

    /// Side-channel identity fetch used during bootstrap.
    pub async fn get_system(&self, addr: &str) -> Result<System, ClientError> {
        self.get_json(addr, "/system").await
    }

    /// Seed-style discovery listing.
    pub async fn get_discovery(&self, addr: &str) -> Result<Vec<DiscoveryEntry>, ClientError> {
        self.get_json(addr, "/api/discovery").await
    }

    /// Bulk cache fetch; peers without the endpoint answer 404.
    pub async fn get_full_sync(&self, addr: &str) -> Result<Vec<System>, ClientError> {
        self.get_json(addr, "/api/full-sync").await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        addr: &str,
        path: &str,
    ) -> Result<T, ClientError> {
        let url = format!("http://{addr}{path}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(addr, e))?;
        Self::decode(addr, response).await
    }

    async fn decode<T: DeserializeOwned>(
        addr: &str,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<WireError>().await {
                Ok(wire) => wire.error,
                Err(_) => status.to_string(),
            };
            return Err(ClientError::Rejected {
                addr: addr.to_string(),
                code: status.as_u16(),
                message,
            });
        }
        response.json::<T>().await.map_err(|e| ClientError::Decode {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }

    fn transport_error(addr: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                addr: addr.to_string(),
            }
        } else {
            ClientError::Connect {
                addr: addr.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
