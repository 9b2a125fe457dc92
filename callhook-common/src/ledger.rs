use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

/// Enumeration of errors for operations with the DedupLedger.
/// Errors originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("migration failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Durable record of every call_id we have accepted, backed by SQLite.
///
/// The check and the mark are two separate statements, so two concurrent deliveries of
/// the same call can both pass `is_duplicate`. That is acceptable: the event table is
/// append-only and reconciliation keeps one row per DID, so a rare double write does not
/// change any derived number.
#[derive(Clone)]
pub struct DedupLedger {
    pool: SqlitePool,
}

impl DedupLedger {
    /// Open (creating if needed) the ledger at `url` and apply migrations.
    pub async fn new(url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|error| LedgerError::ConnectionError { error })?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|error| LedgerError::ConnectionError { error })?;

        Self::new_from_pool(pool).await
    }

    /// Build a ledger on an existing pool, applying migrations.
    pub async fn new_from_pool(pool: SqlitePool) -> LedgerResult<Self> {
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .map_err(|error| LedgerError::MigrationError { error })?;

        Ok(Self { pool })
    }

    /// Close the pool. Later calls fail with a connection error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// A private in-memory ledger. A single connection keeps every query on the same
    /// database.
    pub async fn in_memory() -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|error| LedgerError::ConnectionError { error })?;

        Self::new_from_pool(pool).await
    }

    pub async fn is_duplicate(&self, call_id: &str) -> LedgerResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM processed_calls WHERE call_id = ?")
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| LedgerError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok(found.is_some())
    }

    /// Record `call_id` as processed. Marking an id twice keeps the first timestamp.
    pub async fn mark_processed(&self, call_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        sqlx::query("INSERT OR IGNORE INTO processed_calls (call_id, processed_at) VALUES (?, ?)")
            .bind(call_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|error| LedgerError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    pub async fn len(&self) -> LedgerResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_calls")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| LedgerError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Forget every call first seen before `cutoff`. Returns how many were removed.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM processed_calls WHERE processed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|error| LedgerError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }
}
