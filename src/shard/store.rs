//! Single-file shard store, one per (prover, auditor) pair.
//!
//! Backed by an embedded SQLite database through `sqlx`. Each store holds
//! exactly one table `(id INTEGER PRIMARY KEY, data TEXT, hash TEXT)`;
//! hash-only replicas on the auditor side leave `data` NULL. SQLite's WAL
//! mode gives the multiple-readers/single-writer discipline; bulk loads
//! batch inside one transaction.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// SQLite extended result code for a full disk.
const SQLITE_FULL: &str = "13";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shard store at {path} has an unexpected schema")]
    Corrupt { path: PathBuf },

    #[error("no disk space left for shard write")]
    InsufficientSpace,

    #[error("shard database error: {0}")]
    Sqlx(sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some(SQLITE_FULL) {
                return StoreError::InsufficientSpace;
            }
        }
        StoreError::Sqlx(e)
    }
}

/// One row of a pair shard. `data` is the frozen chunk text, absent in
/// hash-only stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRow {
    pub id: u64,
    pub data: Option<String>,
    pub hash: String,
}

/// Handle to one pair-shard database file.
pub struct ShardStore {
    pool: SqlitePool,
    table: String,
    path: PathBuf,
}

impl ShardStore {
    /// Open (creating if absent) the shard file at `path` with the given
    /// table. The table name must already be validated as alphanumeric
    /// (see [`crate::shard::layout::table_name`]); it is spliced into SQL
    /// as a quoted identifier.
    pub async fn open(path: &Path, table: &str) -> Result<Self, StoreError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            table: table.to_string(),
            path: path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (id INTEGER PRIMARY KEY, data TEXT, hash TEXT NOT NULL)"#,
            self.table
        ))
        .execute(&self.pool)
        .await?;

        // A pre-existing file with a drifted schema is unusable; the caller
        // rebuilds the pair from scratch.
        let columns = sqlx::query(&format!(r#"PRAGMA table_info("{}")"#, self.table))
            .fetch_all(&self.pool)
            .await?;
        let names: Vec<String> = columns
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;
        if names != ["id", "data", "hash"] {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    pub async fn get(&self, id: u64) -> Result<Option<ShardRow>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT data, hash FROM "{}" WHERE id = ?"#,
            self.table
        ))
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ShardRow {
            id,
            data: r.get("data"),
            hash: r.get("hash"),
        }))
    }

    pub async fn get_hash(&self, id: u64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT hash FROM "{}" WHERE id = ?"#,
            self.table
        ))
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    /// Insert-or-replace a single row.
    pub async fn put(
        &self,
        id: u64,
        data: Option<&str>,
        hash: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"INSERT OR REPLACE INTO "{}" (id, data, hash) VALUES (?, ?, ?)"#,
            self.table
        ))
        .bind(id as i64)
        .bind(data)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk load rows inside one transaction. Used by the generator; an
    /// interrupted load leaves the previous contiguous prefix intact.
    pub async fn bulk_insert(&self, rows: &[ShardRow]) -> Result<(), StoreError> {
        let sql = format!(
            r#"INSERT OR REPLACE INTO "{}" (id, data, hash) VALUES (?, ?, ?)"#,
            self.table
        );
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&sql)
                .bind(row.id as i64)
                .bind(row.data.as_deref())
                .bind(row.hash.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete all rows with `id >= n`.
    pub async fn truncate_above(&self, n: u64) -> Result<(), StoreError> {
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id >= ?"#, self.table))
            .bind(n as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!(r#"SELECT COUNT(*) AS n FROM "{}""#, self.table))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    pub async fn max_id(&self) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(&format!(r#"SELECT MAX(id) AS m FROM "{}""#, self.table))
            .fetch_one(&self.pool)
            .await?;
        let m: Option<i64> = row.get("m");
        Ok(m.map(|v| v as u64))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Remove a shard database and its WAL sidecar files. Missing files are
/// not an error.
pub fn remove_shard_files(path: &Path) -> std::io::Result<()> {
    for candidate in [
        path.to_path_buf(),
        PathBuf::from(format!("{}-wal", path.display())),
        PathBuf::from(format!("{}-shm", path.display())),
    ] {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
