//! In-process RPC fabric.
//!
//! Dispatches requests straight into [`ProverService`] handlers, carrying
//! the caller identity the way the network fabric would. Used by the
//! simulator command and the integration tests; production deployments
//! plug a real transport into [`PeerRpc`](super::PeerRpc) instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PeerRpc, PingResponse, RpcError};
use crate::directory::{Peer, PeerId};
use crate::prover::{ProverError, ProverService};

/// Registry of in-process provers, keyed by identity.
#[derive(Default)]
pub struct LocalFabric {
    provers: RwLock<HashMap<PeerId, Arc<ProverService>>>,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, peer_id: PeerId, prover: Arc<ProverService>) {
        self.provers.write().await.insert(peer_id, prover);
    }

    pub async fn deregister(&self, peer_id: &PeerId) {
        self.provers.write().await.remove(peer_id);
    }

    async fn prover_for(&self, peer: &Peer) -> Result<Arc<ProverService>, RpcError> {
        self.provers
            .read()
            .await
            .get(&peer.peer_id)
            .cloned()
            .ok_or_else(|| RpcError::Unavailable(format!("no prover at {}", peer.peer_id)))
    }
}

/// Client handle bound to one caller identity.
pub struct LocalRpc {
    caller: PeerId,
    fabric: Arc<LocalFabric>,
}

impl LocalRpc {
    pub fn new(caller: PeerId, fabric: Arc<LocalFabric>) -> Self {
        Self { caller, fabric }
    }
}

fn map_prover_error(e: ProverError) -> RpcError {
    RpcError::Unavailable(e.to_string())
}

#[async_trait]
impl PeerRpc for LocalRpc {
    async fn ping(&self, peer: &Peer) -> Result<PingResponse, RpcError> {
        Ok(self.fabric.prover_for(peer).await?.handle_ping())
    }

    async fn retrieve(&self, peer: &Peer, key: u64) -> Result<Option<String>, RpcError> {
        self.fabric
            .prover_for(peer)
            .await?
            .handle_retrieve(&self.caller, key)
            .await
            .map_err(map_prover_error)
    }

    async fn store(&self, peer: &Peer, key: u64, data: &str) -> Result<i64, RpcError> {
        self.fabric
            .prover_for(peer)
            .await?
            .handle_store(&self.caller, key, data)
            .await
            .map_err(map_prover_error)
    }
}
