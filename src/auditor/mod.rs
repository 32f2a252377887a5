//! The auditor loop: continuous challenge/verification of provers.
//!
//! For every prover in the directory the auditor keeps a capacity estimate
//! `n_chunks` and probes near its frontier each tick: a correct answer
//! pushes the estimate up additively (`chunk_id + increase_rate`), any
//! failure collapses it toward the sampled chunk
//! (`max(1, chunk_id - decrease_rate)`). Linear growth caps how fast a
//! prover can demand disk; the drop leaves verified older regions intact.
//!
//! Estimates feed an exponential moving average per uid; the normalized
//! vector is emitted to the chain every scoring tick, and the allocation
//! table is snapshotted to disk after each successful emission.

pub mod allocation;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::directory::{ChainClient, ChainError, Peer, PeerDirectory, PeerId};
use crate::encoding::hash_text;
use crate::protocol::{role_banner, PeerRpc, PingResponse};
use crate::shard::{
    generate, generate_all, layout, remove_shard_files, GenerateError, GeneratePlan, LayoutError,
    NodeRole, ShardStore, StoreError,
};

pub use allocation::{load_snapshot, save_snapshot, AllocationRecord, SnapshotError};

#[derive(Debug, Error)]
pub enum AuditorError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Operator-facing knobs for the auditor role. Defaults match the network
/// constants: 4 MiB chunks, 128-chunk starting estimate, +256 / −64 AIMD
/// rates, α = 0.9, 20 s steps, 600 s scoring.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    pub db_root: PathBuf,
    pub wallet: String,
    pub hotkey: String,
    pub own_peer: PeerId,

    pub chunk_size: usize,
    pub default_n_chunks: u64,
    pub increase_rate: u64,
    pub decrease_rate: u64,
    pub alpha: f32,
    pub step_time: Duration,
    pub scores_time: Duration,
    pub workers: usize,

    /// Skip persisting allocations after weight emission.
    pub no_store: bool,
    /// Ignore any previously persisted allocations at startup.
    pub no_restore: bool,
    /// Tear down and regenerate every hash shard on startup.
    pub restart: bool,
}

impl AuditorConfig {
    fn role_dir(&self) -> PathBuf {
        layout::role_dir(&self.db_root, &self.wallet, &self.hotkey, NodeRole::Validator)
    }

    fn snapshot_path(&self) -> PathBuf {
        layout::allocations_path(&self.db_root, &self.wallet, &self.hotkey)
    }
}

/// What one challenge did to the prover's estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Self, unservable endpoint, stale slot, or local hash not yet
    /// materialized: no estimate change either way.
    Skipped,
    Verified { chunk_id: u64, n_chunks: u64 },
    Failed { chunk_id: u64, n_chunks: u64 },
}

/// Pick the chunk to probe: the frontier window `[n − decrease_rate, n)`,
/// or chunk 0 while the estimate is still trivial.
pub fn sample_chunk_id(n_chunks: u64, decrease_rate: u64) -> u64 {
    if n_chunks < 2 {
        return 0;
    }
    let lo = n_chunks.saturating_sub(decrease_rate);
    rand::thread_rng().gen_range(lo..=n_chunks - 1)
}

/// L1-normalize a score vector; an all-zero input stays all zero.
pub fn l1_normalize(scores: &[f32]) -> Vec<f32> {
    let total: f32 = scores.iter().map(|s| s.abs()).sum();
    if total == 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| s / total).collect()
}

pub struct Auditor<R, C> {
    cfg: AuditorConfig,
    rpc: Arc<R>,
    chain: Arc<C>,
    allocations: Arc<RwLock<Vec<AllocationRecord>>>,
    scores: Mutex<Vec<f32>>,
}

impl<R, C> Auditor<R, C>
where
    R: PeerRpc + 'static,
    C: ChainClient + 'static,
{
    pub fn new(cfg: AuditorConfig, rpc: Arc<R>, chain: Arc<C>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            rpc,
            chain,
            allocations: Arc::new(RwLock::new(Vec::new())),
            scores: Mutex::new(Vec::new()),
        })
    }

    /// `ping`: identify the role and version.
    pub fn handle_ping(&self) -> PingResponse {
        PingResponse {
            data: role_banner("validator"),
        }
    }

    /// Copy-on-read snapshot of the allocation table.
    pub async fn allocations(&self) -> Vec<AllocationRecord> {
        self.allocations.read().await.clone()
    }

    fn record_for(&self, prover: &PeerId) -> AllocationRecord {
        AllocationRecord {
            hotkey: prover.clone(),
            n_chunks: self.cfg.default_n_chunks,
            db_path: layout::shard_db_path(&self.cfg.role_dir(), prover, &self.cfg.own_peer),
        }
    }

    fn hash_plan(&self, prover: &PeerId, n_chunks: u64) -> Result<GeneratePlan, LayoutError> {
        GeneratePlan::for_pair(
            &self.cfg.role_dir(),
            prover,
            &self.cfg.own_peer,
            n_chunks,
            self.cfg.chunk_size,
            true,
        )
    }

    /// Restore persisted estimates, align the allocation table with the
    /// directory, clean up orphaned shard files, and materialize every
    /// hash shard before the loop starts.
    pub async fn bootstrap(&self) -> Result<PeerDirectory, AuditorError> {
        let role_dir = self.cfg.role_dir();
        if self.cfg.restart && role_dir.exists() {
            info!(dir = %role_dir.display(), "restart requested, clearing validator shards");
            std::fs::remove_dir_all(&role_dir)?;
        }
        std::fs::create_dir_all(&role_dir)?;

        let restored = if self.cfg.no_restore {
            info!("ignoring previous allocation state");
            Vec::new()
        } else {
            match load_snapshot(&self.cfg.snapshot_path())? {
                Some(records) => {
                    info!(count = records.len(), "restored previously saved allocations");
                    records
                }
                None => {
                    info!("previous allocation state not found");
                    Vec::new()
                }
            }
        };

        let dir = self.chain.fetch_directory().await?;

        let mut records = Vec::with_capacity(dir.len());
        let mut plans = Vec::with_capacity(dir.len());
        for peer in dir.peers() {
            let n_chunks = restored
                .iter()
                .find(|a| a.hotkey == peer.peer_id)
                .map(|a| a.n_chunks.max(1))
                .unwrap_or(self.cfg.default_n_chunks);
            let mut record = self.record_for(&peer.peer_id);
            record.n_chunks = n_chunks;
            plans.push(self.hash_plan(&peer.peer_id, n_chunks)?);
            records.push(record);
        }

        self.remove_orphan_shards(&dir)?;

        *self.allocations.write().await = records;
        *self.scores.lock().await = vec![1.0; dir.len()];

        let results = generate_all(plans.clone(), self.cfg.workers).await;
        for (plan, result) in plans.into_iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(GenerateError::StoreCorrupt { path }) => {
                    // Damaged shard: rebuild the pair from scratch.
                    warn!(db = %path.display(), "hash shard corrupt, rebuilding");
                    remove_shard_files(&path)?;
                    generate(&plan).await?;
                }
                // A failing pair never blocks the rest; its challenges
                // will skip until the shard materializes.
                Err(e) => error!(db = %plan.db_path.display(), error = %e, "hash shard generation failed"),
            }
        }

        Ok(dir)
    }

    /// Delete shard files whose prover is no longer in the directory.
    fn remove_orphan_shards(&self, dir: &PeerDirectory) -> Result<(), AuditorError> {
        let suffix = format!("-{}", self.cfg.own_peer);
        for entry in std::fs::read_dir(self.cfg.role_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(prover) = name
                .strip_prefix("DB-")
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            if !dir.contains(&PeerId::from(prover)) {
                info!(file = %name, "removing shard for deregistered hotkey");
                remove_shard_files(&entry.path())?;
            }
        }
        Ok(())
    }

    /// Challenge every prover, at most `workers` in flight at once.
    pub async fn challenge_tick(&self, dir: &PeerDirectory) {
        futures::stream::iter(dir.peers().iter().cloned().enumerate())
            .for_each_concurrent(self.cfg.workers.max(1), |(uid, peer)| async move {
                let _ = self.challenge_one(uid, peer).await;
            })
            .await;
    }

    async fn expected_hash(
        &self,
        record: &AllocationRecord,
        chunk_id: u64,
    ) -> Result<Option<String>, AuditorError> {
        let table = layout::table_name(&record.hotkey, &self.cfg.own_peer)?;
        let store = ShardStore::open(&record.db_path, &table).await?;
        let hash = store.get_hash(chunk_id).await?;
        store.close().await;
        Ok(hash)
    }

    /// One challenge against the prover in slot `uid`. Each slot is owned
    /// by its own worker; the write-back double-checks the hotkey so a
    /// concurrent churn reset is never clobbered.
    async fn challenge_one(&self, uid: usize, peer: Peer) -> ChallengeOutcome {
        if peer.peer_id == self.cfg.own_peer || peer.is_unservable() {
            return ChallengeOutcome::Skipped;
        }

        let record = {
            let allocations = self.allocations.read().await;
            match allocations.get(uid) {
                Some(record) if record.hotkey == peer.peer_id => record.clone(),
                _ => return ChallengeOutcome::Skipped,
            }
        };

        let chunk_id = sample_chunk_id(record.n_chunks, self.cfg.decrease_rate);
        let response = self.rpc.retrieve(&peer, chunk_id).await;

        let verified = match response {
            Ok(Some(text)) => {
                let expected = match self.expected_hash(&record, chunk_id).await {
                    Ok(Some(hash)) => hash,
                    Ok(None) => {
                        // Local hash shard has not reached this chunk yet;
                        // nothing to judge against.
                        warn!(uid, chunk_id, "no local hash for sampled chunk, skipping");
                        return ChallengeOutcome::Skipped;
                    }
                    Err(e) => {
                        error!(uid, chunk_id, error = %e, "failed to read validation hash");
                        return ChallengeOutcome::Skipped;
                    }
                };
                hash_text(&text) == expected
            }
            Ok(None) => false,
            Err(e) => {
                debug!(uid, chunk_id, error = %e, "retrieve failed");
                false
            }
        };

        let n_chunks = if verified {
            chunk_id + self.cfg.increase_rate
        } else {
            chunk_id.saturating_sub(self.cfg.decrease_rate).max(1)
        };

        {
            let mut allocations = self.allocations.write().await;
            match allocations.get_mut(uid) {
                Some(slot) if slot.hotkey == peer.peer_id => slot.n_chunks = n_chunks,
                _ => return ChallengeOutcome::Skipped,
            }
        }

        if verified {
            info!(uid, chunk_id, n_chunks, "prover provided correct chunk, raising estimate");
            match self.hash_plan(&peer.peer_id, n_chunks) {
                Ok(plan) => {
                    if let Err(e) = generate(&plan).await {
                        error!(uid, error = %e, "failed to extend hash shard");
                    }
                }
                Err(e) => error!(uid, error = %e, "bad hash plan"),
            }
            ChallengeOutcome::Verified { chunk_id, n_chunks }
        } else {
            warn!(uid, chunk_id, n_chunks, "prover failed challenge, reducing estimate");
            ChallengeOutcome::Failed { chunk_id, n_chunks }
        }
    }

    /// Reconcile the allocation table with a freshly fetched directory:
    /// any uid whose hotkey changed gets its shard deleted and its slot
    /// reset to the default estimate.
    pub async fn apply_churn(&self, dir: &PeerDirectory) {
        let mut plans = Vec::new();
        {
            let mut allocations = self.allocations.write().await;
            for (uid, peer) in dir.peers().iter().enumerate() {
                match allocations.get_mut(uid) {
                    Some(slot) if slot.hotkey == peer.peer_id => continue,
                    Some(slot) => {
                        info!(uid, hotkey = %peer.peer_id, "found new hotkey");
                        if let Err(e) = remove_shard_files(&slot.db_path) {
                            error!(uid, error = %e, "failed to delete old shard");
                        }
                        *slot = self.record_for(&peer.peer_id);
                    }
                    None => {
                        allocations.push(self.record_for(&peer.peer_id));
                    }
                }
                match self.hash_plan(&peer.peer_id, self.cfg.default_n_chunks) {
                    Ok(plan) => plans.push(plan),
                    Err(e) => error!(uid, error = %e, "bad hash plan for new hotkey"),
                }
            }
            allocations.truncate(dir.len());
        }
        if !plans.is_empty() {
            generate_all(plans, self.cfg.workers).await;
        }
    }

    /// Fold current estimates into the moving average, emit normalized
    /// weights, and persist the allocation table on success.
    pub async fn scoring_tick(&self, dir: &PeerDirectory) -> Result<(), AuditorError> {
        let allocations = self.allocations.read().await.clone();

        let weights = {
            let mut scores = self.scores.lock().await;
            scores.resize(dir.len(), 1.0);
            for (uid, peer) in dir.peers().iter().enumerate() {
                let n_chunks = allocations
                    .iter()
                    .find(|a| a.hotkey == peer.peer_id)
                    .map(|a| a.n_chunks)
                    .unwrap_or(0);
                scores[uid] =
                    self.cfg.alpha * scores[uid] + (1.0 - self.cfg.alpha) * n_chunks as f32;
                debug!(uid, hotkey = %peer.peer_id, score = scores[uid], n_chunks, "score");
            }
            l1_normalize(&scores)
        };

        info!(?weights, "setting weights");
        match self.chain.submit_weights(&weights).await {
            Ok(true) => {
                info!("successfully set weights");
                if !self.cfg.no_store {
                    save_snapshot(&self.cfg.snapshot_path(), &allocations)?;
                    info!("stored verified allocations locally");
                }
            }
            Ok(false) => error!("failed to set weights"),
            Err(e) => error!(error = %e, "weight submission failed"),
        }
        Ok(())
    }

    /// The main validation loop. Never returns under normal operation;
    /// per-prover failures are absorbed, only startup errors surface.
    pub async fn run(self: Arc<Self>) -> Result<(), AuditorError> {
        let mut dir = self.bootstrap().await?;

        let steps_per_score = (self.cfg.scores_time.as_secs() / self.cfg.step_time.as_secs().max(1))
            .max(1);
        let mut step: u64 = 0;
        info!("starting auditor loop");

        loop {
            let started = Instant::now();
            self.challenge_tick(&dir).await;
            info!(
                step,
                elapsed_secs = started.elapsed().as_secs_f64(),
                "finished validation step"
            );

            match self.chain.fetch_directory().await {
                Ok(fresh) => dir = fresh,
                Err(e) => error!(error = %e, "directory refresh failed"),
            }
            self.apply_churn(&dir).await;

            if step % steps_per_score == 0 {
                if let Err(e) = self.scoring_tick(&dir).await {
                    error!(error = %e, "scoring tick failed");
                }
            }

            step += 1;
            tokio::time::sleep(self.cfg.step_time).await;
        }
    }
}
