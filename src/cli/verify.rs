//! Verify the row integrity of a shard database.
//!
//! Walks every table from id 0 upward and checks that each row's hash is
//! the SHA-256 of its stored text. Hash-only stores (NULL data) cannot be
//! verified this way and are reported as such.

use std::path::PathBuf;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;

use tensorage::encoding::hash_text;

pub async fn execute(db_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !db_path.exists() {
        return Err(format!("database not found: {}", db_path.display()).into());
    }
    let options = SqliteConnectOptions::new().filename(&db_path);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    let tables = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(&pool)
        .await?;

    for table in tables {
        let name: String = table.get("name");
        if name.starts_with("sqlite_") {
            continue;
        }

        let mut id: i64 = 0;
        let mut hash_only = 0u64;
        loop {
            let row = sqlx::query(&format!(r#"SELECT data, hash FROM "{name}" WHERE id = ?"#))
                .bind(id)
                .fetch_optional(&pool)
                .await?;
            let Some(row) = row else {
                break;
            };

            let data: Option<String> = row.get("data");
            let stored_hash: String = row.get("hash");
            match data {
                Some(text) => {
                    let computed = hash_text(&text);
                    if computed != stored_hash {
                        pool.close().await;
                        return Err(format!(
                            "Hash mismatch for key {id} in table '{name}': \
                             computed {computed}, stored {stored_hash}"
                        )
                        .into());
                    }
                }
                None => hash_only += 1,
            }
            id += 1;
        }

        if hash_only > 0 {
            println!("Table '{name}': {id} rows, {hash_only} hash-only (data not stored)");
        } else {
            println!("Table '{name}': verified {id} rows");
        }
    }

    pool.close().await;
    println!("Verified {}", db_path.display());
    Ok(())
}
