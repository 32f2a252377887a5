//! The prover service: serves chunks back to the auditors that challenge it.
//!
//! A prover keeps one full data shard per auditor in the directory, sized
//! stake-proportionally, and answers `ping` / `retrieve` / `store` from
//! authenticated auditor peers. A periodic reallocation pass diffs the
//! directory: shards for departed auditors are torn down, new auditors get
//! shards generated in the background. Reallocation never runs twice
//! concurrently; a pass is skipped while a previous generation is still in
//! flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::directory::{ChainClient, PeerDirectory, PeerId};
use crate::encoding::hash_text;
use crate::protocol::{role_banner, PingResponse, FAILED_KEY};
use crate::shard::{
    generate_all, layout, remove_shard_files, GeneratePlan, LayoutError, NodeRole, ShardStore,
    StoreError,
};

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: &'static str },

    #[error("no shard for caller {0}")]
    UnknownPair(PeerId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Operator-facing knobs for the prover role.
#[derive(Debug, Clone)]
pub struct ProverConfig {
    pub db_root: PathBuf,
    pub wallet: String,
    pub hotkey: String,
    pub own_peer: PeerId,

    /// Total bytes to spread across auditors, stake-proportionally.
    pub size_bytes: u64,
    pub chunk_size: usize,
    pub workers: usize,
    pub reallocate_interval: Duration,

    /// Tear down and regenerate every shard on startup.
    pub restart: bool,
}

impl ProverConfig {
    fn role_dir(&self) -> PathBuf {
        layout::role_dir(&self.db_root, &self.wallet, &self.hotkey, NodeRole::Miner)
    }
}

/// Lifecycle of one (self, auditor) pair on the prover side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Background generation still writing rows; ids written so far are
    /// served, the rest answer null.
    Generating,
    Serving,
}

struct PairHandle {
    store: Arc<ShardStore>,
    n_chunks: u64,
    state: PairState,
}

/// Stake-proportional chunk counts: each directory slot gets
/// `((stake + 1) / Σ(stake + 1)) · size_bytes` worth of chunks, plus one.
pub fn stake_allocations(
    dir: &PeerDirectory,
    size_bytes: u64,
    chunk_size: usize,
) -> Vec<(PeerId, u64)> {
    let denom = dir.stake_denominator();
    dir.peers()
        .iter()
        .filter(|p| p.is_auditor)
        .map(|p| {
            let share = (p.stake + 1.0) / denom * size_bytes as f64;
            let n_chunks = (share / chunk_size as f64) as u64 + 1;
            (p.peer_id.clone(), n_chunks)
        })
        .collect()
}

pub struct ProverService {
    cfg: ProverConfig,
    directory: RwLock<PeerDirectory>,
    pairs: Arc<RwLock<HashMap<PeerId, PairHandle>>>,
    generation: Mutex<Option<JoinHandle<()>>>,
}

impl ProverService {
    pub async fn new(cfg: ProverConfig) -> Result<Arc<Self>, ProverError> {
        let role_dir = cfg.role_dir();
        if cfg.restart && role_dir.exists() {
            info!(dir = %role_dir.display(), "restart requested, clearing miner shards");
            std::fs::remove_dir_all(&role_dir)?;
        }
        std::fs::create_dir_all(&role_dir)?;

        Ok(Arc::new(Self {
            cfg,
            directory: RwLock::new(PeerDirectory::default()),
            pairs: Arc::new(RwLock::new(HashMap::new())),
            generation: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ProverConfig {
        &self.cfg
    }

    /// Reject callers that are not auditors in the current directory.
    async fn admit(&self, caller: &PeerId) -> Result<(), ProverError> {
        let dir = self.directory.read().await;
        let Some(peer) = dir.find(caller) else {
            warn!(%caller, "blacklisting unrecognized hotkey");
            return Err(ProverError::Unauthorized {
                reason: "unrecognized hotkey",
            });
        };
        if !peer.is_auditor {
            warn!(%caller, "blacklisting non-validator hotkey");
            return Err(ProverError::Unauthorized {
                reason: "non-validator hotkey",
            });
        }
        Ok(())
    }

    /// `ping`: identify the role and version. Side-effect free.
    pub fn handle_ping(&self) -> PingResponse {
        PingResponse {
            data: role_banner("miner"),
        }
    }

    /// `retrieve(key)`: chunk text from the caller's pair shard, or null
    /// for ids not (yet) written.
    pub async fn handle_retrieve(
        &self,
        caller: &PeerId,
        key: u64,
    ) -> Result<Option<String>, ProverError> {
        self.admit(caller).await?;

        let pairs = self.pairs.read().await;
        let Some(pair) = pairs.get(caller) else {
            return Err(ProverError::UnknownPair(caller.clone()));
        };
        let store = Arc::clone(&pair.store);
        drop(pairs);

        Ok(store.get(key).await?.and_then(|row| row.data))
    }

    /// `store(key, data)`: overwrite the row, rehashing the text. Returns
    /// the key on success or [`FAILED_KEY`] when the write is rejected
    /// (unknown pair, beyond the pair's declared capacity, disk failure).
    pub async fn handle_store(
        &self,
        caller: &PeerId,
        key: u64,
        data: &str,
    ) -> Result<i64, ProverError> {
        self.admit(caller).await?;

        let pairs = self.pairs.read().await;
        let Some(pair) = pairs.get(caller) else {
            warn!(%caller, key, "store for unknown pair rejected");
            return Ok(FAILED_KEY);
        };
        if key >= pair.n_chunks {
            warn!(%caller, key, cap = pair.n_chunks, "store beyond declared capacity rejected");
            return Ok(FAILED_KEY);
        }
        let store = Arc::clone(&pair.store);
        drop(pairs);

        let hash = hash_text(data);
        match store.put(key, Some(data), &hash).await {
            Ok(()) => {
                info!(%caller, key, "stored chunk");
                Ok(key as i64)
            }
            Err(e) => {
                error!(%caller, key, error = %e, "store failed");
                Ok(FAILED_KEY)
            }
        }
    }

    pub async fn generation_in_flight(&self) -> bool {
        self.generation
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Await the current background generation, if any. Used by tests and
    /// the simulator to reach a settled state.
    pub async fn wait_for_generation(&self) {
        let handle = self.generation.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "generation task failed");
            }
        }
    }

    /// Diff the directory against the open pairs: tear down shards of
    /// departed auditors, (re)size the rest, and generate in the
    /// background. Skipped while a previous generation is in flight.
    pub async fn reallocate(&self, dir: PeerDirectory) -> Result<(), ProverError> {
        if self.generation_in_flight().await {
            info!("previous generation still in flight, skipping reallocation");
            return Ok(());
        }

        *self.directory.write().await = dir.clone();

        let targets: HashMap<PeerId, u64> =
            stake_allocations(&dir, self.cfg.size_bytes, self.cfg.chunk_size)
                .into_iter()
                .collect();
        let role_dir = self.cfg.role_dir();

        let mut pairs = self.pairs.write().await;

        let departed: Vec<PeerId> = pairs
            .keys()
            .filter(|id| !targets.contains_key(*id))
            .cloned()
            .collect();
        for auditor in departed {
            if let Some(handle) = pairs.remove(&auditor) {
                info!(%auditor, "auditor left the directory, deleting shard");
                handle.store.close().await;
                remove_shard_files(handle.store.path())?;
            }
        }

        let mut plans = Vec::with_capacity(targets.len());
        for (auditor, n_chunks) in &targets {
            let plan = GeneratePlan::for_pair(
                &role_dir,
                &self.cfg.own_peer,
                auditor,
                *n_chunks,
                self.cfg.chunk_size,
                false,
            )?;
            match pairs.get_mut(auditor) {
                Some(handle) => {
                    handle.n_chunks = *n_chunks;
                }
                None => {
                    let store = ShardStore::open(&plan.db_path, &plan.table_name).await?;
                    pairs.insert(
                        auditor.clone(),
                        PairHandle {
                            store: Arc::new(store),
                            n_chunks: *n_chunks,
                            state: PairState::Generating,
                        },
                    );
                }
            }
            plans.push(plan);
        }
        drop(pairs);

        let pairs = Arc::clone(&self.pairs);
        let workers = self.cfg.workers;
        let auditors: Vec<PeerId> = targets.keys().cloned().collect();
        let handle = tokio::spawn(async move {
            let results = generate_all(plans, workers).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                warn!(failed, total = results.len(), "some pair shards failed to generate");
            }
            let mut pairs = pairs.write().await;
            for auditor in &auditors {
                if let Some(handle) = pairs.get_mut(auditor) {
                    handle.state = PairState::Serving;
                }
            }
        });
        *self.generation.lock().await = Some(handle);

        Ok(())
    }

    pub async fn pair_state(&self, auditor: &PeerId) -> Option<PairState> {
        self.pairs.read().await.get(auditor).map(|p| p.state)
    }

    pub async fn pair_capacity(&self, auditor: &PeerId) -> Option<u64> {
        self.pairs.read().await.get(auditor).map(|p| p.n_chunks)
    }

    /// Close every open store handle. Called on shutdown.
    pub async fn shutdown(&self) {
        self.wait_for_generation().await;
        let pairs = self.pairs.read().await;
        for handle in pairs.values() {
            handle.store.close().await;
        }
        info!("prover shut down, {} pair(s) closed", pairs.len());
    }

    /// Maintenance loop: refresh the directory and reallocate on the
    /// configured interval. Runs until the task is cancelled.
    pub async fn run<C: ChainClient>(self: Arc<Self>, chain: Arc<C>) {
        let mut ticker = tokio::time::interval(self.cfg.reallocate_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match chain.fetch_directory().await {
                Ok(dir) => {
                    if let Err(e) = self.reallocate(dir).await {
                        error!(error = %e, "reallocation failed");
                    }
                }
                Err(e) => error!(error = %e, "directory refresh failed"),
            }
        }
    }
}

/// Human-readable byte sizes for allocation logs.
pub fn human_readable_size(size: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "KB")];
    for (threshold, unit) in UNITS {
        if size >= threshold {
            return format!("{:.2} {}", size as f64 / threshold as f64, unit);
        }
    }
    format!("{size} bytes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Peer;
    use tempfile::TempDir;

    const TEST_CHUNK: usize = 64;

    fn peer(uid: u16, id: &str, stake: f64, is_auditor: bool) -> Peer {
        Peer {
            uid,
            peer_id: PeerId::from(id),
            endpoint: format!("10.0.0.{}:8091", uid + 1),
            stake,
            is_auditor,
        }
    }

    fn test_config(tmp: &TempDir) -> ProverConfig {
        ProverConfig {
            db_root: tmp.path().to_path_buf(),
            wallet: "default".to_string(),
            hotkey: "5Own".to_string(),
            own_peer: PeerId::from("5Own"),
            size_bytes: (TEST_CHUNK * 16) as u64,
            chunk_size: TEST_CHUNK,
            workers: 2,
            reallocate_interval: Duration::from_secs(600),
            restart: false,
        }
    }

    async fn settled_prover(
        tmp: &TempDir,
        dir: &PeerDirectory,
    ) -> Arc<ProverService> {
        let prover = ProverService::new(test_config(tmp)).await.unwrap();
        prover.reallocate(dir.clone()).await.unwrap();
        prover.wait_for_generation().await;
        prover
    }

    fn two_peer_directory() -> PeerDirectory {
        PeerDirectory::new(vec![
            peer(0, "5Aud", 100.0, true),
            peer(1, "5Other", 0.0, false),
        ])
    }

    #[test]
    fn stake_allocations_are_proportional_plus_one() {
        let dir = PeerDirectory::new(vec![
            peer(0, "5A", 9.0, true),
            peer(1, "5B", 0.0, true),
            peer(2, "5C", 0.0, false),
        ]);
        // denom = 10 + 1 + 1 = 12; size 1200 bytes, chunk 10 bytes.
        let allocs: HashMap<PeerId, u64> = stake_allocations(&dir, 1200, 10).into_iter().collect();
        assert_eq!(allocs.len(), 2, "only auditors get shards");
        assert_eq!(allocs[&PeerId::from("5A")], 101); // 1000 / 10 + 1
        assert_eq!(allocs[&PeerId::from("5B")], 11); // 100 / 10 + 1
    }

    #[tokio::test]
    async fn admission_rejects_unknown_and_non_auditors() {
        let tmp = TempDir::new().unwrap();
        let dir = two_peer_directory();
        let prover = settled_prover(&tmp, &dir).await;

        let err = prover
            .handle_retrieve(&PeerId::from("5Stranger"), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProverError::Unauthorized { reason: "unrecognized hotkey" }
        ));

        let err = prover
            .handle_retrieve(&PeerId::from("5Other"), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProverError::Unauthorized { reason: "non-validator hotkey" }
        ));
    }

    #[tokio::test]
    async fn retrieve_serves_generated_rows() {
        let tmp = TempDir::new().unwrap();
        let dir = two_peer_directory();
        let prover = settled_prover(&tmp, &dir).await;
        let auditor = PeerId::from("5Aud");

        let data = prover.handle_retrieve(&auditor, 0).await.unwrap();
        let text = data.expect("row 0 exists after generation");
        assert_eq!(
            text,
            crate::shard::chunk_text(
                &layout::pair_seed(&PeerId::from("5Own"), &auditor),
                0,
                TEST_CHUNK
            )
        );

        // Ids past the shard answer null.
        let cap = prover.pair_capacity(&auditor).await.unwrap();
        assert!(prover.handle_retrieve(&auditor, cap + 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_overwrites_and_respects_capacity() {
        let tmp = TempDir::new().unwrap();
        let dir = two_peer_directory();
        let prover = settled_prover(&tmp, &dir).await;
        let auditor = PeerId::from("5Aud");

        let key = prover
            .handle_store(&auditor, 1, "b'\\xaa\\xbb'")
            .await
            .unwrap();
        assert_eq!(key, 1);
        assert_eq!(
            prover.handle_retrieve(&auditor, 1).await.unwrap().as_deref(),
            Some("b'\\xaa\\xbb'")
        );

        let cap = prover.pair_capacity(&auditor).await.unwrap();
        let rejected = prover
            .handle_store(&auditor, cap, "b'\\x00'")
            .await
            .unwrap();
        assert_eq!(rejected, FAILED_KEY);
    }

    #[tokio::test]
    async fn reallocation_tears_down_departed_auditors() {
        let tmp = TempDir::new().unwrap();
        let dir = two_peer_directory();
        let prover = settled_prover(&tmp, &dir).await;
        let auditor = PeerId::from("5Aud");

        let role_dir = prover.cfg.role_dir();
        let db_path = layout::shard_db_path(&role_dir, &PeerId::from("5Own"), &auditor);
        assert!(db_path.exists());

        // Auditor drops out of the directory.
        let shrunk = PeerDirectory::new(vec![peer(0, "5Other", 0.0, false)]);
        prover.reallocate(shrunk).await.unwrap();
        prover.wait_for_generation().await;

        assert!(!db_path.exists());
        assert!(prover.pair_state(&auditor).await.is_none());
    }

    #[tokio::test]
    async fn reallocation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = two_peer_directory();
        let prover = settled_prover(&tmp, &dir).await;
        let auditor = PeerId::from("5Aud");

        let cap_before = prover.pair_capacity(&auditor).await.unwrap();
        let store = ShardStore::open(
            &layout::shard_db_path(&prover.cfg.role_dir(), &PeerId::from("5Own"), &auditor),
            &layout::table_name(&PeerId::from("5Own"), &auditor).unwrap(),
        )
        .await
        .unwrap();
        let rows_before = store.count().await.unwrap();

        prover.reallocate(dir).await.unwrap();
        prover.wait_for_generation().await;

        assert_eq!(prover.pair_capacity(&auditor).await.unwrap(), cap_before);
        assert_eq!(store.count().await.unwrap(), rows_before);
    }

    #[tokio::test]
    async fn ping_reports_miner_role() {
        let tmp = TempDir::new().unwrap();
        let prover = ProverService::new(test_config(&tmp)).await.unwrap();
        assert!(prover.handle_ping().data.starts_with("miner-"));
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_readable_size(512), "512 bytes");
        assert_eq!(human_readable_size(2 << 20), "2.00 MB");
        assert_eq!(human_readable_size(3 << 30), "3.00 GB");
    }
}
