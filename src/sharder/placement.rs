//! Placement indexes for sharded files.
//!
//! Each stored file gets its own single-file database under the wallet's
//! `data/` directory, named by a random 256-bit hex string. One row per
//! (chunk, prover) placement: `saved_data(chunk_id, miner_hotkey,
//! miner_key)`. Redundant placements are extra rows for the same chunk id.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::directory::PeerId;

const TABLE: &str = "saved_data";

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("placement index {0} does not exist")]
    NotFound(String),

    #[error("placement database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A random 256-bit index name, as lowercase hex.
pub fn random_index_name() -> String {
    let noise: [u8; 32] = rand::random();
    hex::encode(Sha256::digest(noise))
}

/// Where the chunks of one stored file live.
pub struct PlacementIndex {
    pool: SqlitePool,
    path: PathBuf,
}

impl PlacementIndex {
    /// Create a fresh index under `data_dir`, returning its name.
    pub async fn create(data_dir: &Path) -> Result<(String, Self), PlacementError> {
        std::fs::create_dir_all(data_dir)?;
        let name = random_index_name();
        let path = data_dir.join(format!("{name}.db"));

        let pool = connect(&path, true).await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} \
             (chunk_id INTEGER NOT NULL, miner_hotkey TEXT NOT NULL, miner_key INTEGER NOT NULL)"
        ))
        .execute(&pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{TABLE}_chunk ON {TABLE} (chunk_id)"
        ))
        .execute(&pool)
        .await?;

        Ok((name, Self { pool, path }))
    }

    /// Open an existing index by name.
    pub async fn open(data_dir: &Path, name: &str) -> Result<Self, PlacementError> {
        let path = data_dir.join(format!("{name}.db"));
        if !path.exists() {
            return Err(PlacementError::NotFound(name.to_string()));
        }
        let pool = connect(&path, false).await?;
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `prover` holds chunk `chunk_id` under its key `key`.
    pub async fn append(
        &self,
        chunk_id: u64,
        prover: &PeerId,
        key: u64,
    ) -> Result<(), PlacementError> {
        sqlx::query(&format!(
            "INSERT INTO {TABLE} (chunk_id, miner_hotkey, miner_key) VALUES (?, ?, ?)"
        ))
        .bind(chunk_id as i64)
        .bind(prover.as_str())
        .bind(key as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All placements recorded for one chunk, in insertion order.
    pub async fn candidates(&self, chunk_id: u64) -> Result<Vec<(PeerId, u64)>, PlacementError> {
        let rows = sqlx::query(&format!(
            "SELECT miner_hotkey, miner_key FROM {TABLE} WHERE chunk_id = ? ORDER BY rowid"
        ))
        .bind(chunk_id as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let hotkey: String = row.get("miner_hotkey");
                let key: i64 = row.get("miner_key");
                (PeerId::new(hotkey), key as u64)
            })
            .collect())
    }

    /// `max(chunk_id) + 1`, or zero for an empty index.
    pub async fn total_chunks(&self) -> Result<u64, PlacementError> {
        let row = sqlx::query(&format!("SELECT MAX(chunk_id) AS m FROM {TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        let max: Option<i64> = row.get("m");
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create);
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
}
