//! Wire protocol envelopes and the RPC client boundary.
//!
//! Three request kinds cross the network, each carrying the caller's
//! authenticated [`PeerId`](crate::directory::PeerId) at the fabric layer:
//! `ping`, `retrieve(key)` and `store(key, data)`. The transport itself is
//! external; this module pins down the envelopes and the [`PeerRpc`] trait
//! the auditor and file sharder program against.
//!
//! All chunk payloads are the frozen text form from [`crate::encoding`].

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::Peer;

/// Sentinel a prover returns when it could not store a chunk.
pub const FAILED_KEY: i64 = -1;

/// `"<role>-<semver>"` banner returned by `ping`.
pub fn role_banner(role: &str) -> String {
    format!("{role}-{}", env!("CARGO_PKG_VERSION"))
}

/// Identify the responder's role and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub data: String,
}

/// Fetch the chunk stored under `key` in the caller's pair shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieve {
    pub key: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    /// Chunk text, or `None` when the key is unknown.
    pub data: Option<String>,
}

/// Overwrite the chunk under `key` in the caller's pair shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub key: u64,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    /// The key the chunk was stored under, or [`FAILED_KEY`].
    pub key: i64,
}

/// Recoverable transport failures. The auditor folds both kinds into its
/// failure branch; the sharder retries within its loop budget.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("peer unavailable: {0}")]
    Unavailable(String),
}

/// Outbound RPC surface toward a single peer. Implemented by the external
/// fabric in production and by [`local::LocalRpc`] in tests and the
/// simulator.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn ping(&self, peer: &Peer) -> Result<PingResponse, RpcError>;

    async fn retrieve(&self, peer: &Peer, key: u64) -> Result<Option<String>, RpcError>;

    /// Returns the key the chunk was stored under, or [`FAILED_KEY`].
    async fn store(&self, peer: &Peer, key: u64, data: &str) -> Result<i64, RpcError>;
}
