//! SQLite connection and schema setup shared by the local object store and
//! the progress ledger.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use std::{path::Path, str::FromStr};

/// Schema for bucket, object and multipart metadata.
pub const OBJECT_STORE_SCHEMA: &str = include_str!("../migrations/0001_object_store.sql");

/// Schema for the append-only progress ledger.
pub const LEDGER_SCHEMA: &str = include_str!("../migrations/0002_ledger.sql");

/// Open a pool against `url`, creating the database file (and its parent
/// directory) when missing.
///
/// Every commit is fsynced (`synchronous = FULL`), which is what the ledger
/// relies on for its volume-open and volume-commit durability points.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let db_path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Apply an embedded schema, one statement at a time.
///
/// Every statement is `IF NOT EXISTS`, so this runs on each open.
pub async fn run_migrations(db: &SqlitePool, schema: &str) -> Result<(), sqlx::Error> {
    let statements = schema
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::trace!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
