use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use callhook_common::event::EVENT_COLUMNS;
use callhook_common::store::{ensure_header, with_timeout, StoreError, TabularStore};

use crate::config::OverflowPolicy;
use crate::sink::SinkError;

/// A row waiting for the batch writer, tagged with its call for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow {
    pub call_id: String,
    pub row: Vec<Value>,
}

/// Result of admitting a row to a full or non-full queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// The row was queued after evicting the oldest pending call.
    DroppedOldest { evicted: String },
}

/// Bounded FIFO between request handlers and the batch writer. Never blocks a pusher:
/// a full queue either refuses the row or evicts its oldest entry.
pub struct IngestQueue {
    rows: Mutex<VecDeque<PendingRow>>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl IngestQueue {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            rows: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow,
        }
    }

    pub async fn push(&self, pending: PendingRow) -> Result<Admission, SinkError> {
        let mut rows = self.rows.lock().await;

        let admission = if rows.len() < self.capacity {
            Admission::Queued
        } else {
            match self.overflow {
                OverflowPolicy::Reject => {
                    metrics::counter!("callhook_queue_rejected_total").increment(1);
                    return Err(SinkError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => match rows.pop_front() {
                    Some(evicted) => {
                        metrics::counter!("callhook_queue_dropped_total").increment(1);
                        warn!(call_id = %evicted.call_id, "queue full, dropped oldest row");
                        Admission::DroppedOldest {
                            evicted: evicted.call_id,
                        }
                    }
                    None => Admission::Queued,
                },
            }
        };

        rows.push_back(pending);
        metrics::gauge!("callhook_queue_depth").set(rows.len() as f64);

        Ok(admission)
    }

    /// Remove up to `max` of the oldest rows, preserving their order.
    pub async fn take_batch(&self, max: usize) -> Vec<PendingRow> {
        let mut rows = self.rows.lock().await;
        let count = max.min(rows.len());
        let batch: Vec<PendingRow> = rows.drain(..count).collect();
        metrics::gauge!("callhook_queue_depth").set(rows.len() as f64);
        batch
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("header check failed: {0}")]
    Header(#[source] StoreError),
    #[error("append of {rows} rows failed: {error}")]
    Append {
        rows: usize,
        #[source]
        error: StoreError,
    },
}

pub struct WriterSettings {
    pub table: String,
    pub batch_size: usize,
    pub header_timeout: Duration,
    pub append_timeout: Duration,
}

/// Drains the ingest queue into the event table in bounded batches.
pub struct BatchWriter {
    queue: Arc<IngestQueue>,
    store: Arc<dyn TabularStore + Send + Sync>,
    settings: WriterSettings,
    // Serialises flushes, so the shutdown flush never races a tick.
    flush_lock: Mutex<()>,
}

impl BatchWriter {
    pub fn new(
        queue: Arc<IngestQueue>,
        store: Arc<dyn TabularStore + Send + Sync>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            queue,
            store,
            settings,
            flush_lock: Mutex::new(()),
        }
    }

    /// Write at most one batch. Returns how many rows were written.
    ///
    /// A failed header check leaves every row queued. A failed append drops the batch:
    /// its call ids are logged and the backfill poller recovers them from the source.
    pub async fn flush_once(&self) -> Result<usize, WriterError> {
        let _guard = self.flush_lock.lock().await;

        if self.queue.is_empty().await {
            return Ok(0);
        }

        let table = self.settings.table.as_str();
        with_timeout(
            "header check",
            table,
            self.settings.header_timeout,
            ensure_header(self.store.as_ref(), table, &EVENT_COLUMNS),
        )
        .await
        .map_err(WriterError::Header)?;

        let batch = self.queue.take_batch(self.settings.batch_size).await;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        metrics::histogram!("callhook_batch_size").record(count as f64);

        let call_ids: Vec<String> = batch.iter().map(|p| p.call_id.clone()).collect();
        let rows = batch.into_iter().map(|p| p.row).collect();

        match with_timeout(
            "append",
            table,
            self.settings.append_timeout,
            self.store.append_rows(table, rows),
        )
        .await
        {
            Ok(()) => {
                metrics::counter!("callhook_batches_written_total").increment(1);
                debug!(rows = count, table, "wrote batch");
                Ok(count)
            }
            Err(error) => {
                metrics::counter!("callhook_batches_failed_total").increment(1);
                error!(rows = count, table, ?call_ids, "batch append failed: {}", error);
                Err(WriterError::Append { rows: count, error })
            }
        }
    }

    /// Flush on every tick until `shutdown` fires, then drain what is left.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        backoff: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.flush_once().await {
                warn!("batch writer backing off for {:?}: {}", backoff, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        self.drain().await;
    }

    /// Flush until the queue is empty or a flush fails.
    pub async fn drain(&self) {
        loop {
            match self.flush_once().await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    let remaining = self.queue.len().await;
                    error!(remaining, "final flush failed: {}", e);
                    break;
                }
            }
        }
        info!("batch writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callhook_common::store::MemoryStore;
    use serde_json::json;

    fn pending(call_id: &str) -> PendingRow {
        PendingRow {
            call_id: call_id.to_owned(),
            row: vec![json!(call_id)],
        }
    }

    fn settings(batch_size: usize) -> WriterSettings {
        WriterSettings {
            table: "Raw".to_owned(),
            batch_size,
            header_timeout: Duration::from_secs(5),
            append_timeout: Duration::from_secs(10),
        }
    }

    /// Fails every append; header operations succeed.
    struct FailingAppends(MemoryStore);

    #[async_trait]
    impl TabularStore for FailingAppends {
        async fn append_rows(&self, _: &str, _: Vec<Vec<Value>>) -> Result<(), StoreError> {
            Err(StoreError::BadStatus {
                status: 503,
                body: "unavailable".to_owned(),
            })
        }
        async fn read_rows(&self, table: &str) -> Result<Vec<Vec<String>>, StoreError> {
            self.0.read_rows(table).await
        }
        async fn replace_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
            self.0.replace_rows(table, rows).await
        }
        async fn header(&self, table: &str) -> Result<Vec<String>, StoreError> {
            self.0.header(table).await
        }
        async fn set_header(&self, table: &str, header: &[&str]) -> Result<(), StoreError> {
            self.0.set_header(table, header).await
        }
    }

    #[tokio::test]
    async fn reject_policy_refuses_when_full() {
        let queue = IngestQueue::new(2, OverflowPolicy::Reject);

        assert_eq!(queue.push(pending("a")).await.unwrap(), Admission::Queued);
        assert_eq!(queue.push(pending("b")).await.unwrap(), Admission::Queued);
        assert!(matches!(
            queue.push(pending("c")).await,
            Err(SinkError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn drop_oldest_policy_evicts_head() {
        let queue = IngestQueue::new(2, OverflowPolicy::DropOldest);

        queue.push(pending("a")).await.unwrap();
        queue.push(pending("b")).await.unwrap();
        assert_eq!(
            queue.push(pending("c")).await.unwrap(),
            Admission::DroppedOldest {
                evicted: "a".to_owned()
            }
        );

        let batch = queue.take_batch(10).await;
        let ids: Vec<&str> = batch.iter().map(|p| p.call_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn batches_respect_size_and_order() {
        let queue = Arc::new(IngestQueue::new(100, OverflowPolicy::Reject));
        let store = MemoryStore::new();
        let writer = BatchWriter::new(queue.clone(), Arc::new(store.clone()), settings(25));

        for i in 0..60 {
            queue.push(pending(&format!("CA{i}"))).await.unwrap();
        }

        assert_eq!(writer.flush_once().await.unwrap(), 25);
        assert_eq!(writer.flush_once().await.unwrap(), 25);
        assert_eq!(writer.flush_once().await.unwrap(), 10);
        assert_eq!(writer.flush_once().await.unwrap(), 0);

        let rows = store.rows("Raw");
        assert_eq!(rows.len(), 61);
        assert_eq!(rows[0].len(), EVENT_COLUMNS.len());
        assert_eq!(rows[1], vec![json!("CA0")]);
        assert_eq!(rows[60], vec![json!("CA59")]);
    }

    #[tokio::test]
    async fn empty_queue_touches_nothing() {
        let queue = Arc::new(IngestQueue::new(10, OverflowPolicy::Reject));
        let store = MemoryStore::new();
        let writer = BatchWriter::new(queue, Arc::new(store.clone()), settings(25));

        assert_eq!(writer.flush_once().await.unwrap(), 0);
        assert!(store.rows("Raw").is_empty());
    }

    #[tokio::test]
    async fn failed_append_drops_the_batch() {
        let queue = Arc::new(IngestQueue::new(10, OverflowPolicy::Reject));
        let writer = BatchWriter::new(
            queue.clone(),
            Arc::new(FailingAppends(MemoryStore::new())),
            settings(2),
        );

        for id in ["a", "b", "c"] {
            queue.push(pending(id)).await.unwrap();
        }

        assert!(matches!(
            writer.flush_once().await,
            Err(WriterError::Append { rows: 2, .. })
        ));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_rows() {
        let queue = Arc::new(IngestQueue::new(100, OverflowPolicy::Reject));
        let store = MemoryStore::new();
        let writer = Arc::new(BatchWriter::new(
            queue.clone(),
            Arc::new(store.clone()),
            settings(2),
        ));

        for id in ["a", "b", "c", "d", "e"] {
            queue.push(pending(id)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        writer
            .run(Duration::from_secs(3600), Duration::from_secs(5), shutdown)
            .await;

        assert!(queue.is_empty().await);
        assert_eq!(store.rows("Raw").len(), 6);
    }
}
