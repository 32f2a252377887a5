//! Peer directory types and the chain-client boundary.
//!
//! The roster of peers (hotkeys, endpoints, stake, role bits) is supplied by
//! an external chain client and refreshed every step. This module owns the
//! types that cross that boundary plus the [`ChainClient`] trait the rest of
//! the crate programs against. A file-backed implementation is provided for
//! deployments where an out-of-process bridge maintains the roster, and for
//! the in-process simulator.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SS58-encoded network identity of a participant (a "hotkey").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One directory slot: identity plus the metadata needed to serve or
/// challenge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Slot index in the directory, stable between registrations.
    pub uid: u16,

    pub peer_id: PeerId,

    /// `ip:port` of the peer's RPC endpoint.
    pub endpoint: String,

    /// Stake backing this peer; drives stake-proportional shard sizing.
    pub stake: f64,

    /// Role bit: auditors challenge provers and may call `store`/`retrieve`.
    pub is_auditor: bool,
}

impl Peer {
    /// A peer that has registered but never served an endpoint is
    /// unreachable and skipped by the auditor.
    pub fn is_unservable(&self) -> bool {
        self.endpoint.is_empty() || self.endpoint.starts_with("0.0.0.0")
    }
}

/// Ordered peer roster, indexed by uid. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, uid: usize) -> Option<&Peer> {
        self.peers.get(uid)
    }

    pub fn find(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.find(peer_id).is_some()
    }

    pub fn is_auditor(&self, peer_id: &PeerId) -> bool {
        self.find(peer_id).map(|p| p.is_auditor).unwrap_or(false)
    }

    /// Sum of `stake + 1` over all slots, the denominator of the
    /// stake-proportional allocation formula.
    pub fn stake_denominator(&self) -> f64 {
        self.peers.iter().map(|p| p.stake + 1.0).sum()
    }
}

/// Errors crossing the chain boundary.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("malformed directory: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The external chain client: supplies the peer directory and accepts
/// weight updates. Implementations live outside the core; tests and the
/// simulator use [`FileChainClient`] or mocks.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetch the current peer directory.
    async fn fetch_directory(&self) -> Result<PeerDirectory, ChainError>;

    /// Submit L1-normalized weights, one per uid. Returns whether the
    /// update was accepted.
    async fn submit_weights(&self, weights: &[f32]) -> Result<bool, ChainError>;
}

/// File-backed chain client: reads the directory from a JSON file on every
/// fetch and appends accepted weight vectors to a sibling JSONL file.
///
/// An external bridge process owns the directory file; this keeps the chain
/// protocol itself out of the core.
pub struct FileChainClient {
    directory_path: PathBuf,
    weights_path: PathBuf,
}

impl FileChainClient {
    pub fn new(directory_path: PathBuf) -> Self {
        let weights_path = directory_path.with_extension("weights.jsonl");
        Self {
            directory_path,
            weights_path,
        }
    }
}

#[async_trait]
impl ChainClient for FileChainClient {
    async fn fetch_directory(&self) -> Result<PeerDirectory, ChainError> {
        let raw = tokio::fs::read_to_string(&self.directory_path).await?;
        serde_json::from_str(&raw).map_err(|e| ChainError::Malformed(e.to_string()))
    }

    async fn submit_weights(&self, weights: &[f32]) -> Result<bool, ChainError> {
        let mut line = serde_json::to_string(weights)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.weights_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(true)
    }
}
