//! Deterministic pair-shard generation.
//!
//! Chunk content is a pure function of the pair seed and the chunk id: a
//! ChaCha20 keystream keyed by the 32-byte seed with the chunk id in the
//! nonce. Both sides of a pair derive identical bytes without ever
//! exchanging them, and appending chunks never disturbs earlier rows.
//!
//! Generation is idempotent in `(pair, n_chunks)`: an existing store is
//! grown, shrunk or left alone to match the requested count. Auditors
//! generate hash-only rows (half the disk); provers always write the full
//! text.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::directory::PeerId;
use crate::encoding::{encode_chunk, hash_text};
use crate::shard::layout::{self, LayoutError};
use crate::shard::store::{ShardRow, ShardStore, StoreError};

/// Rough per-row bookkeeping bytes (key, hash text, b-tree overhead) used
/// for the free-space pre-check.
const ROW_OVERHEAD: u64 = 128;

/// Cap on the bytes of chunk text materialized per insert transaction.
const BATCH_BUDGET_BYTES: u64 = 32 << 20;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("not enough disk space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("shard at {path} does not match its seed")]
    StoreCorrupt { path: PathBuf },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("generator worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to materialize one pair shard.
#[derive(Debug, Clone)]
pub struct GeneratePlan {
    pub db_path: PathBuf,
    pub table_name: String,
    pub seed: [u8; 32],
    pub n_chunks: u64,
    pub chunk_size: usize,
    pub only_hash: bool,
}

impl GeneratePlan {
    /// Plan for the (prover, auditor) pair under the given role directory.
    pub fn for_pair(
        role_dir: &Path,
        prover: &PeerId,
        auditor: &PeerId,
        n_chunks: u64,
        chunk_size: usize,
        only_hash: bool,
    ) -> Result<Self, LayoutError> {
        Ok(Self {
            db_path: layout::shard_db_path(role_dir, prover, auditor),
            table_name: layout::table_name(prover, auditor)?,
            seed: layout::pair_seed(prover, auditor),
            n_chunks,
            chunk_size,
            only_hash,
        })
    }

    fn bytes_per_row(&self) -> u64 {
        if self.only_hash {
            ROW_OVERHEAD
        } else {
            self.chunk_size as u64 * 4 + ROW_OVERHEAD
        }
    }
}

/// Raw bytes of one chunk: `chunk_size` bytes of ChaCha20 keystream keyed
/// by the seed, nonce = 4 zero bytes then the chunk id as u64 LE.
pub fn chunk_bytes(seed: &[u8; 32], chunk_id: u64, chunk_size: usize) -> Vec<u8> {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&chunk_id.to_le_bytes());

    let mut cipher = ChaCha20::new(seed.into(), (&nonce).into());
    let mut buf = vec![0u8; chunk_size];
    cipher.apply_keystream(&mut buf);
    buf
}

/// The wire text of one chunk.
pub fn chunk_text(seed: &[u8; 32], chunk_id: u64, chunk_size: usize) -> String {
    encode_chunk(&chunk_bytes(seed, chunk_id, chunk_size))
}

/// The stored hash of one chunk: SHA-256 over the text form.
pub fn chunk_hash(seed: &[u8; 32], chunk_id: u64, chunk_size: usize) -> String {
    hash_text(&chunk_text(seed, chunk_id, chunk_size))
}

/// Materialize the plan against its store, growing or shrinking as needed.
pub async fn generate(plan: &GeneratePlan) -> Result<(), GenerateError> {
    let store = ShardStore::open(&plan.db_path, &plan.table_name).await?;
    let result = generate_into(&store, plan).await;
    store.close().await;
    result
}

async fn generate_into(store: &ShardStore, plan: &GeneratePlan) -> Result<(), GenerateError> {
    let existing = store.count().await?;

    // Sample row 0 against the seed; drift means the file belongs to some
    // other pair or was damaged, and the caller rebuilds from scratch.
    if existing > 0 {
        let stored = store.get_hash(0).await?;
        let expected = chunk_hash(&plan.seed, 0, plan.chunk_size);
        if stored.as_deref() != Some(expected.as_str()) {
            return Err(GenerateError::StoreCorrupt {
                path: plan.db_path.clone(),
            });
        }
    }

    if existing > plan.n_chunks {
        debug!(
            db = %plan.db_path.display(),
            from = existing,
            to = plan.n_chunks,
            "shrinking shard"
        );
        store.truncate_above(plan.n_chunks).await?;
        return Ok(());
    }
    if existing == plan.n_chunks {
        return Ok(());
    }

    check_free_space(plan, plan.n_chunks - existing)?;

    let batch = if plan.only_hash {
        256
    } else {
        (BATCH_BUDGET_BYTES / plan.bytes_per_row()).max(1)
    };

    let mut next = existing;
    while next < plan.n_chunks {
        let end = (next + batch).min(plan.n_chunks);
        let seed = plan.seed;
        let chunk_size = plan.chunk_size;
        let only_hash = plan.only_hash;

        // Keystream + hex + SHA-256 are CPU-bound; keep them off the
        // executor threads.
        let rows = tokio::task::spawn_blocking(move || {
            (next..end)
                .map(|id| {
                    let text = chunk_text(&seed, id, chunk_size);
                    let hash = hash_text(&text);
                    ShardRow {
                        id,
                        data: (!only_hash).then_some(text),
                        hash,
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| GenerateError::Worker(e.to_string()))?;

        store.bulk_insert(&rows).await?;
        next = end;
    }

    info!(
        db = %plan.db_path.display(),
        n_chunks = plan.n_chunks,
        only_hash = plan.only_hash,
        "shard generated"
    );
    Ok(())
}

fn check_free_space(plan: &GeneratePlan, new_rows: u64) -> Result<(), GenerateError> {
    let dir = plan
        .db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let available = fs2::available_space(&dir)?;
    let needed = new_rows * plan.bytes_per_row();
    if needed > available {
        return Err(GenerateError::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Run many plans concurrently on a bounded pool. A failing pair never
/// aborts its siblings; per-plan results come back in input order.
pub async fn generate_all(
    plans: Vec<GeneratePlan>,
    workers: usize,
) -> Vec<Result<(), GenerateError>> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));

    let handles: Vec<_> = plans
        .into_iter()
        .map(|plan| {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| GenerateError::Worker(e.to_string()))?;
                let result = generate(&plan).await;
                if let Err(e) = &result {
                    error!(db = %plan.db_path.display(), error = %e, "shard generation failed");
                }
                result
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap_or_else(|e| Err(GenerateError::Worker(e.to_string()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const TEST_CHUNK: usize = 64;

    fn seed_of(pair: &str) -> [u8; 32] {
        layout::pair_seed(&PeerId::from(pair), &PeerId::from("5Aud"))
    }

    fn plan(tmp: &TempDir, n_chunks: u64, only_hash: bool) -> GeneratePlan {
        GeneratePlan::for_pair(
            tmp.path(),
            &PeerId::from("5Prov"),
            &PeerId::from("5Aud"),
            n_chunks,
            TEST_CHUNK,
            only_hash,
        )
        .unwrap()
    }

    #[test]
    fn chunks_differ_by_id_but_not_by_run() {
        let seed = seed_of("5Prov");
        assert_eq!(
            chunk_bytes(&seed, 0, TEST_CHUNK),
            chunk_bytes(&seed, 0, TEST_CHUNK)
        );
        assert_ne!(
            chunk_bytes(&seed, 0, TEST_CHUNK),
            chunk_bytes(&seed, 1, TEST_CHUNK)
        );
    }

    #[tokio::test]
    async fn independent_generations_agree() {
        // Two machines generating the same pair must land on identical
        // hash columns.
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        let plan_a = plan(&tmp_a, 4, false);
        let plan_b = plan(&tmp_b, 4, true);
        generate(&plan_a).await.unwrap();
        generate(&plan_b).await.unwrap();

        let store_a = ShardStore::open(&plan_a.db_path, &plan_a.table_name)
            .await
            .unwrap();
        let store_b = ShardStore::open(&plan_b.db_path, &plan_b.table_name)
            .await
            .unwrap();
        for id in 0..4 {
            assert_eq!(
                store_a.get_hash(id).await.unwrap(),
                store_b.get_hash(id).await.unwrap(),
                "hash mismatch at id {id}"
            );
        }
    }

    #[tokio::test]
    async fn rows_hash_their_own_text() {
        let tmp = TempDir::new().unwrap();
        let p = plan(&tmp, 3, false);
        generate(&p).await.unwrap();

        let store = ShardStore::open(&p.db_path, &p.table_name).await.unwrap();
        for id in 0..3 {
            let row = store.get(id).await.unwrap().unwrap();
            let text = row.data.expect("prover rows carry data");
            assert_eq!(hash_text(&text), row.hash);
        }
    }

    #[tokio::test]
    async fn generation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let p = plan(&tmp, 5, true);
        generate(&p).await.unwrap();
        generate(&p).await.unwrap();

        let store = ShardStore::open(&p.db_path, &p.table_name).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 5);
        assert_eq!(store.max_id().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn growing_preserves_existing_rows() {
        let tmp = TempDir::new().unwrap();
        let small = plan(&tmp, 4, true);
        generate(&small).await.unwrap();

        let store = ShardStore::open(&small.db_path, &small.table_name)
            .await
            .unwrap();
        let mut before = Vec::new();
        for id in 0..4 {
            before.push(store.get_hash(id).await.unwrap().unwrap());
        }

        let mut grown = small.clone();
        grown.n_chunks = 9;
        generate(&grown).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 9);
        for (id, old) in before.iter().enumerate() {
            assert_eq!(
                store.get_hash(id as u64).await.unwrap().as_deref(),
                Some(old.as_str())
            );
        }
    }

    #[tokio::test]
    async fn shrinking_deletes_the_tail() {
        let tmp = TempDir::new().unwrap();
        let big = plan(&tmp, 8, true);
        generate(&big).await.unwrap();

        let mut shrunk = big.clone();
        shrunk.n_chunks = 3;
        generate(&shrunk).await.unwrap();

        let store = ShardStore::open(&big.db_path, &big.table_name).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
        assert!(store.get_hash(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_hash_leaves_data_null() {
        let tmp = TempDir::new().unwrap();
        let p = plan(&tmp, 2, true);
        generate(&p).await.unwrap();

        let store = ShardStore::open(&p.db_path, &p.table_name).await.unwrap();
        let row = store.get(0).await.unwrap().unwrap();
        assert!(row.data.is_none());
        assert_eq!(row.hash, chunk_hash(&p.seed, 0, TEST_CHUNK));
    }

    #[tokio::test]
    async fn seed_drift_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let p = plan(&tmp, 2, true);
        generate(&p).await.unwrap();

        // Damage row 0, then ask for a regeneration.
        let store = ShardStore::open(&p.db_path, &p.table_name).await.unwrap();
        store.put(0, None, "not-the-right-hash").await.unwrap();
        store.close().await;

        let mut grown = p.clone();
        grown.n_chunks = 4;
        let err = generate(&grown).await.err().unwrap();
        assert!(matches!(err, GenerateError::StoreCorrupt { .. }));
    }

    #[tokio::test]
    async fn generate_all_survives_a_bad_plan() {
        let tmp = TempDir::new().unwrap();
        let good = plan(&tmp, 2, true);
        let mut bad = plan(&tmp, 2, true);
        bad.table_name = "has space".to_string();
        bad.db_path = tmp.path().join("DB-bad");

        let results = generate_all(vec![bad, good.clone()], 2).await;
        assert!(results[0].is_err());
        assert!(results[1].is_ok());

        let store = ShardStore::open(&good.db_path, &good.table_name)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prf_is_deterministic(owner in "[A-Za-z0-9]{4,16}", id in 0u64..1024) {
            let seed = seed_of(&owner);
            prop_assert_eq!(
                chunk_hash(&seed, id, TEST_CHUNK),
                chunk_hash(&seed, id, TEST_CHUNK)
            );
        }

        #[test]
        fn different_pairs_disagree(a in "[A-Za-z0-9]{4,16}", b in "[A-Za-z0-9]{4,16}") {
            prop_assume!(a != b);
            prop_assert_ne!(
                chunk_bytes(&seed_of(&a), 0, TEST_CHUNK),
                chunk_bytes(&seed_of(&b), 0, TEST_CHUNK)
            );
        }
    }
}
