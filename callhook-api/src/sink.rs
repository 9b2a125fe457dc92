use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use callhook_common::event::{CallEvent, EVENT_COLUMNS};
use callhook_common::store::{ensure_header, with_timeout, StoreError, TabularStore};

use crate::queue::{IngestQueue, PendingRow};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write event: {0}")]
    Store(#[from] StoreError),
    #[error("ingest queue is full ({capacity} rows)")]
    QueueFull { capacity: usize },
}

/// Where accepted events go. Both implementations honour the same contract: every
/// accepted event is eventually appended to the event table, at least once, unless the
/// store stays unavailable.
#[async_trait]
pub trait PersistenceSink {
    async fn persist(&self, event: &CallEvent) -> Result<(), SinkError>;

    /// Rows accepted but not yet written.
    async fn pending(&self) -> usize {
        0
    }
}

/// Appends each event synchronously, making sure the header row is in place first.
/// Only a failed append fails the event.
pub struct DirectSink {
    store: Arc<dyn TabularStore + Send + Sync>,
    table: String,
    header_timeout: Duration,
    append_timeout: Duration,
}

impl DirectSink {
    pub fn new(
        store: Arc<dyn TabularStore + Send + Sync>,
        table: &str,
        header_timeout: Duration,
        append_timeout: Duration,
    ) -> Self {
        Self {
            store,
            table: table.to_owned(),
            header_timeout,
            append_timeout,
        }
    }
}

#[async_trait]
impl PersistenceSink for DirectSink {
    async fn persist(&self, event: &CallEvent) -> Result<(), SinkError> {
        let table = self.table.as_str();

        // A header failure must not cost the row; the append still goes ahead.
        if let Err(e) = with_timeout(
            "header check",
            table,
            self.header_timeout,
            ensure_header(self.store.as_ref(), table, &EVENT_COLUMNS),
        )
        .await
        {
            metrics::counter!("callhook_header_check_failures_total").increment(1);
            warn!(call_id = %event.call_id, table, "header check failed, appending anyway: {}", e);
        }

        with_timeout(
            "append",
            table,
            self.append_timeout,
            self.store.append_rows(table, vec![event.to_row()]),
        )
        .await?;

        debug!(call_id = %event.call_id, table, "wrote event");
        Ok(())
    }
}

/// Stages events in the bounded queue for the batch writer.
pub struct QueuedSink {
    queue: Arc<IngestQueue>,
}

impl QueuedSink {
    pub fn new(queue: Arc<IngestQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl PersistenceSink for QueuedSink {
    async fn persist(&self, event: &CallEvent) -> Result<(), SinkError> {
        self.queue
            .push(PendingRow {
                call_id: event.call_id.clone(),
                row: event.to_row(),
            })
            .await?;

        Ok(())
    }

    async fn pending(&self) -> usize {
        self.queue.len().await
    }
}
