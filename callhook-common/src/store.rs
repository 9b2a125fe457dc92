use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request to the tabular store failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("tabular store returned {status}: {body}")]
    BadStatus { status: u16, body: String },
    #[error("invalid tabular store url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("tabular store returned an unreadable body: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("could not obtain an access token: {0}")]
    AuthError(String),
    #[error("{operation} on {table} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        table: String,
        timeout: Duration,
    },
}

/// A remote store of named tables, each a list of rows of cells.
/// Row 0 of every table is its header.
#[async_trait]
pub trait TabularStore {
    /// Add rows after the last non-empty row.
    async fn append_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError>;
    /// Every row of the table, header included, as rendered text.
    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<String>>, StoreError>;
    /// Drop all existing rows and write `rows` in their place.
    async fn replace_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError>;
    async fn header(&self, table: &str) -> Result<Vec<String>, StoreError>;
    async fn set_header(&self, table: &str, header: &[&str]) -> Result<(), StoreError>;
}

/// Make sure the first row of `table` is exactly `header`, writing it otherwise.
/// Returns whether a write was needed.
pub async fn ensure_header(
    store: &(dyn TabularStore + Send + Sync),
    table: &str,
    header: &[&str],
) -> Result<bool, StoreError> {
    let current = store.header(table).await?;
    if current.iter().map(String::as_str).eq(header.iter().copied()) {
        return Ok(false);
    }

    store.set_header(table, header).await?;
    info!(table, "wrote header row");

    Ok(true)
}

/// Bound a store call by `timeout`, turning expiry into `StoreError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    table: &str,
    timeout: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            table: table.to_owned(),
            timeout,
        }),
    }
}

/// Render a cell the way a spreadsheet displays it.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

/// Tables kept in process memory. Used for local development and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, Vec<Vec<Value>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with rows as text.
    pub fn with_table(self, table: &str, rows: Vec<Vec<&str>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Value::from).collect())
            .collect();
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_owned(), rows);
        self
    }

    /// The raw cells of a table, header included.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn append_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.entry(table.to_owned()).or_default().extend(rows);
        Ok(())
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self
            .rows(table)
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn replace_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.insert(table.to_owned(), rows);
        Ok(())
    }

    async fn header(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.read_rows(table).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn set_header(&self, table: &str, header: &[&str]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(table.to_owned()).or_default();
        let header = header.iter().copied().map(Value::from).collect();
        match rows.first_mut() {
            Some(first) => *first = header,
            None => rows.push(header),
        }
        Ok(())
    }
}
