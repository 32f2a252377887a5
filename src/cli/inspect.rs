//! Inspect the size and schema of a shard database.

use std::path::PathBuf;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;

pub async fn execute(db_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let size = std::fs::metadata(&db_path)?.len();
    println!(
        "Size of the database: {:.2} MB",
        size as f64 / (1024.0 * 1024.0)
    );

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

        let count_row = sqlx::query(&format!(r#"SELECT COUNT(*) AS n FROM "{name}""#))
            .fetch_one(&pool)
            .await?;
        let rows: i64 = count_row.get("n");
        println!("\nSchema for table '{name}' ({rows} rows):");

        let columns = sqlx::query(&format!(r#"PRAGMA table_info("{name}")"#))
            .fetch_all(&pool)
            .await?;
        for column in columns {
            let col_name: String = column.get("name");
            let col_type: String = column.get("type");
            println!("  {col_name} ({col_type})");
        }
    }

    pool.close().await;
    Ok(())
}
