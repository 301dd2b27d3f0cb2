//! `SQLite` connection pool and schema bootstrap.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::{AppError, Result};

/// Connect to the on-disk database, creating file and schema on first
/// use.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Connect to an in-memory database for tests.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|err| AppError::Db(err.to_string()))?;
    // One connection so every query sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS reattach_record (
            role TEXT PRIMARY KEY,
            process_id INTEGER NOT NULL,
            process_start_ticks INTEGER NOT NULL,
            access_token TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            build_id TEXT NOT NULL,
            written_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}
