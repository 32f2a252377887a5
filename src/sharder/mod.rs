//! File sharding over the prover fleet.
//!
//! Splits a client file into fixed-size chunks, pushes each chunk to a
//! random subset of provers with redundancy, and records every accepted
//! placement in a per-file index database. Retrieval walks the index in
//! chunk order, verifies each candidate response against the locally held
//! hash, and reassembles the original bytes.
//!
//! Chunks travel in the frozen text form; verification hashes the text
//! exactly as returned, never the decoded bytes.

pub mod placement;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::directory::{Peer, PeerDirectory, PeerId};
use crate::encoding::{decode_chunk, encode_chunk, hash_text, EncodingError};
use crate::protocol::{PeerRpc, FAILED_KEY};
use crate::shard::{layout, LayoutError, NodeRole, ShardStore, StoreError};

pub use placement::{PlacementError, PlacementIndex};

#[derive(Debug, Error)]
pub enum SharderError {
    #[error("no prover accepted chunk {chunk_id}")]
    InsufficientCapacity { chunk_id: u64 },

    #[error("chunk {chunk_id} is missing")]
    ChunkMissing { chunk_id: u64 },

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SharderConfig {
    pub db_root: PathBuf,
    pub wallet: String,
    pub hotkey: String,
    pub own_peer: PeerId,

    pub chunk_size: usize,
    /// Placements to secure per chunk.
    pub chunk_store_count: usize,
    /// Retry rounds per chunk before giving up.
    pub limit_loop_count: usize,
}

impl SharderConfig {
    fn data_dir(&self) -> PathBuf {
        layout::data_dir(&self.db_root, &self.wallet, &self.hotkey)
    }

    fn validator_dir(&self) -> PathBuf {
        layout::role_dir(&self.db_root, &self.wallet, &self.hotkey, NodeRole::Validator)
    }
}

/// Result of a successful [`FileSharder::store_file`].
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// Name of the placement index recording where every chunk went.
    pub db_name: String,
    pub chunks: u64,
}

pub struct FileSharder<R> {
    cfg: SharderConfig,
    rpc: Arc<R>,
}

impl<R: PeerRpc> FileSharder<R> {
    pub fn new(cfg: SharderConfig, rpc: Arc<R>) -> Self {
        Self { cfg, rpc }
    }

    /// Provers eligible to hold chunks: everything in the directory that
    /// is reachable and not ourselves or an auditor.
    fn eligible<'d>(&self, dir: &'d PeerDirectory) -> Vec<&'d Peer> {
        dir.peers()
            .iter()
            .filter(|p| !p.is_auditor && !p.is_unservable() && p.peer_id != self.cfg.own_peer)
            .collect()
    }

    async fn pair_store<'c>(
        &self,
        cache: &'c mut HashMap<PeerId, ShardStore>,
        prover: &PeerId,
    ) -> Result<&'c ShardStore, SharderError> {
        if !cache.contains_key(prover) {
            let path = layout::shard_db_path(&self.cfg.validator_dir(), prover, &self.cfg.own_peer);
            let table = layout::table_name(prover, &self.cfg.own_peer)?;
            cache.insert(prover.clone(), ShardStore::open(&path, &table).await?);
        }
        Ok(&cache[prover])
    }

    /// Stream `path` into the fleet. Every chunk must land on at least one
    /// prover; each accepted placement is recorded in a fresh index
    /// database whose name is returned.
    pub async fn store_file(
        &self,
        dir: &PeerDirectory,
        path: &Path,
    ) -> Result<StoreOutcome, SharderError> {
        let candidates = self.eligible(dir);
        let (db_name, index) = PlacementIndex::create(&self.cfg.data_dir()).await?;
        let mut pair_stores = HashMap::new();

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; self.cfg.chunk_size];
        let mut chunk_number: u64 = 0;

        loop {
            let read = read_window(&mut file, &mut buf).await?;
            if read == 0 {
                break;
            }
            let text = encode_chunk(&buf[..read]);
            let hash = hash_text(&text);

            let placed = self
                .place_chunk(&candidates, chunk_number, &text)
                .await;
            if placed.is_empty() {
                close_all(pair_stores).await;
                index.close().await;
                return Err(SharderError::InsufficientCapacity { chunk_id: chunk_number });
            }

            for (prover, key) in &placed {
                index.append(chunk_number, prover, *key).await?;
                // Remember the hash under the prover's key so retrieval can
                // verify responses against our own pair shard.
                let store = self.pair_store(&mut pair_stores, prover).await?;
                store.put(*key, None, &hash).await?;
            }

            chunk_number += 1;
        }

        close_all(pair_stores).await;
        index.close().await;
        info!(%db_name, chunks = chunk_number, "file stored across fleet");
        Ok(StoreOutcome {
            db_name,
            chunks: chunk_number,
        })
    }

    /// Offer one chunk to random provers until enough accept or the retry
    /// budget runs out. Returns the accepted (prover, key) placements.
    async fn place_chunk(
        &self,
        candidates: &[&Peer],
        chunk_number: u64,
        text: &str,
    ) -> Vec<(PeerId, u64)> {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut placed = Vec::new();
        let mut cursor = 0;
        let mut rounds = 0;

        while placed.len() < self.cfg.chunk_store_count
            && rounds < self.cfg.limit_loop_count
            && cursor < order.len()
        {
            rounds += 1;
            let wave = (self.cfg.chunk_store_count * 2).min(order.len() - cursor);
            for &idx in &order[cursor..cursor + wave] {
                let peer = candidates[idx];
                match self.rpc.store(peer, chunk_number, text).await {
                    Ok(key) if key != FAILED_KEY => {
                        placed.push((peer.peer_id.clone(), key as u64));
                    }
                    Ok(_) => {
                        warn!(chunk_number, prover = %peer.peer_id, "prover rejected chunk");
                    }
                    Err(e) => {
                        warn!(chunk_number, prover = %peer.peer_id, error = %e, "store rpc failed");
                    }
                }
            }
            cursor += wave;
        }
        placed
    }

    /// Reassemble a stored file into `output`. Each chunk is accepted from
    /// the first candidate whose response hashes to the locally recorded
    /// value, retrying up to the loop budget.
    pub async fn retrieve_file(
        &self,
        dir: &PeerDirectory,
        db_name: &str,
        output: &Path,
    ) -> Result<(), SharderError> {
        let index = PlacementIndex::open(&self.cfg.data_dir(), db_name).await?;
        let total = index.total_chunks().await?;
        let mut pair_stores = HashMap::new();

        let mut out = tokio::fs::File::create(output).await?;
        for chunk_id in 0..total {
            let rows = index.candidates(chunk_id).await?;
            let Some((first_prover, first_key)) = rows.first().cloned() else {
                return Err(SharderError::ChunkMissing { chunk_id });
            };

            let expected = {
                let store = self.pair_store(&mut pair_stores, &first_prover).await?;
                store.get_hash(first_key).await?
            };
            let Some(expected) = expected else {
                warn!(chunk_id, "no local hash for placement");
                return Err(SharderError::ChunkMissing { chunk_id });
            };

            let Some(text) = self.fetch_verified(dir, &rows, &expected).await else {
                return Err(SharderError::ChunkMissing { chunk_id });
            };
            let bytes = decode_chunk(&text)?;
            out.write_all(&bytes).await?;
        }
        out.flush().await?;

        close_all(pair_stores).await;
        index.close().await;
        info!(%db_name, chunks = total, output = %output.display(), "file reassembled");
        Ok(())
    }

    async fn fetch_verified(
        &self,
        dir: &PeerDirectory,
        rows: &[(PeerId, u64)],
        expected: &str,
    ) -> Option<String> {
        for _ in 0..self.cfg.limit_loop_count {
            for (prover, key) in rows {
                let Some(peer) = dir.find(prover) else {
                    continue;
                };
                match self.rpc.retrieve(peer, *key).await {
                    Ok(Some(text)) if hash_text(&text) == expected => return Some(text),
                    Ok(Some(_)) => {
                        warn!(prover = %prover, key, "hash mismatch from prover");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(prover = %prover, key, error = %e, "retrieve rpc failed");
                    }
                }
            }
        }
        None
    }
}

/// Fill `buf` as far as the file allows; a short read only happens at EOF.
async fn read_window(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn close_all(stores: HashMap<PeerId, ShardStore>) {
    for store in stores.values() {
        store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PingResponse, RpcError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TEST_CHUNK: usize = 32;

    /// In-memory fleet: provers accept or reject by script and serve back
    /// what they accepted.
    struct FleetRpc {
        held: Mutex<HashMap<(PeerId, u64), String>>,
        rejecting: Mutex<Vec<PeerId>>,
        corrupt: Mutex<Vec<PeerId>>,
    }

    impl FleetRpc {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                held: Mutex::new(HashMap::new()),
                rejecting: Mutex::new(Vec::new()),
                corrupt: Mutex::new(Vec::new()),
            })
        }

        fn reject(&self, prover: &PeerId) {
            self.rejecting.lock().unwrap().push(prover.clone());
        }

        fn corrupt(&self, prover: &PeerId) {
            self.corrupt.lock().unwrap().push(prover.clone());
        }
    }

    #[async_trait]
    impl PeerRpc for FleetRpc {
        async fn ping(&self, _peer: &Peer) -> Result<PingResponse, RpcError> {
            Ok(PingResponse {
                data: "miner-test".to_string(),
            })
        }

        async fn retrieve(&self, peer: &Peer, key: u64) -> Result<Option<String>, RpcError> {
            if self.corrupt.lock().unwrap().contains(&peer.peer_id) {
                return Ok(Some("b'\\x00'".to_string()));
            }
            Ok(self
                .held
                .lock()
                .unwrap()
                .get(&(peer.peer_id.clone(), key))
                .cloned())
        }

        async fn store(&self, peer: &Peer, key: u64, data: &str) -> Result<i64, RpcError> {
            if self.rejecting.lock().unwrap().contains(&peer.peer_id) {
                return Ok(FAILED_KEY);
            }
            self.held
                .lock()
                .unwrap()
                .insert((peer.peer_id.clone(), key), data.to_string());
            Ok(key as i64)
        }
    }

    fn peer(uid: u16, id: &str, is_auditor: bool) -> Peer {
        Peer {
            uid,
            peer_id: PeerId::from(id),
            endpoint: format!("10.0.0.{}:8091", uid + 1),
            stake: 0.0,
            is_auditor,
        }
    }

    fn fleet_directory() -> PeerDirectory {
        PeerDirectory::new(vec![
            peer(0, "5Own", true),
            peer(1, "5MinerA", false),
            peer(2, "5MinerB", false),
        ])
    }

    fn test_config(tmp: &TempDir, chunk_store_count: usize) -> SharderConfig {
        SharderConfig {
            db_root: tmp.path().to_path_buf(),
            wallet: "default".to_string(),
            hotkey: "5Own".to_string(),
            own_peer: PeerId::from("5Own"),
            chunk_size: TEST_CHUNK,
            chunk_store_count,
            limit_loop_count: 3,
        }
    }

    async fn write_input(tmp: &TempDir, len: usize) -> PathBuf {
        let path = tmp.path().join("input.bin");
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn store_and_retrieve_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let rpc = FleetRpc::new();
        let sharder = FileSharder::new(test_config(&tmp, 1), Arc::clone(&rpc));
        let dir = fleet_directory();

        // Two full chunks and a partial tail.
        let input = write_input(&tmp, TEST_CHUNK * 2 + 11).await;
        let outcome = sharder.store_file(&dir, &input).await.unwrap();
        assert_eq!(outcome.chunks, 3);

        let index = PlacementIndex::open(
            &layout::data_dir(tmp.path(), "default", "5Own"),
            &outcome.db_name,
        )
        .await
        .unwrap();
        assert_eq!(index.total_chunks().await.unwrap(), 3);

        let output = tmp.path().join("output.bin");
        sharder
            .retrieve_file(&dir, &outcome.db_name, &output)
            .await
            .unwrap();

        let original = tokio::fs::read(&input).await.unwrap();
        let restored = tokio::fs::read(&output).await.unwrap();
        assert_eq!(original, restored);
    }

    #[tokio::test]
    async fn rejections_fall_through_to_other_provers() {
        let tmp = TempDir::new().unwrap();
        let rpc = FleetRpc::new();
        rpc.reject(&PeerId::from("5MinerA"));
        let sharder = FileSharder::new(test_config(&tmp, 1), Arc::clone(&rpc));
        let dir = fleet_directory();

        let input = write_input(&tmp, TEST_CHUNK).await;
        let outcome = sharder.store_file(&dir, &input).await.unwrap();

        let index = PlacementIndex::open(
            &layout::data_dir(tmp.path(), "default", "5Own"),
            &outcome.db_name,
        )
        .await
        .unwrap();
        let rows = index.candidates(0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, PeerId::from("5MinerB"));
    }

    #[tokio::test]
    async fn full_fleet_rejection_is_insufficient_capacity() {
        let tmp = TempDir::new().unwrap();
        let rpc = FleetRpc::new();
        rpc.reject(&PeerId::from("5MinerA"));
        rpc.reject(&PeerId::from("5MinerB"));
        let sharder = FileSharder::new(test_config(&tmp, 1), Arc::clone(&rpc));

        let input = write_input(&tmp, TEST_CHUNK).await;
        let err = sharder
            .store_file(&fleet_directory(), &input)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SharderError::InsufficientCapacity { chunk_id: 0 }
        ));
    }

    #[tokio::test]
    async fn corrupt_candidate_falls_back_to_redundant_copy() {
        let tmp = TempDir::new().unwrap();
        let rpc = FleetRpc::new();
        let sharder = FileSharder::new(test_config(&tmp, 2), Arc::clone(&rpc));
        let dir = fleet_directory();

        let input = write_input(&tmp, TEST_CHUNK).await;
        let outcome = sharder.store_file(&dir, &input).await.unwrap();

        // Whichever prover answers first with bad bytes, the other copy
        // must satisfy retrieval.
        rpc.corrupt(&PeerId::from("5MinerA"));
        let output = tmp.path().join("output.bin");
        sharder
            .retrieve_file(&dir, &outcome.db_name, &output)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(&input).await.unwrap(),
            tokio::fs::read(&output).await.unwrap()
        );
    }

    #[tokio::test]
    async fn vanished_chunks_are_missing() {
        let tmp = TempDir::new().unwrap();
        let rpc = FleetRpc::new();
        let sharder = FileSharder::new(test_config(&tmp, 1), Arc::clone(&rpc));
        let dir = fleet_directory();

        let input = write_input(&tmp, TEST_CHUNK).await;
        let outcome = sharder.store_file(&dir, &input).await.unwrap();

        // The fleet forgets everything it held.
        rpc.held.lock().unwrap().clear();

        let err = sharder
            .retrieve_file(&dir, &outcome.db_name, &tmp.path().join("out.bin"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SharderError::ChunkMissing { chunk_id: 0 }));
    }
}
