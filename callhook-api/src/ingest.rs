use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use callhook_common::event::{CallEvent, EventError};
use callhook_common::ledger::{DedupLedger, LedgerError};
use callhook_common::repair::parse_payload;
use callhook_common::time::TimeSource;

use crate::sink::{PersistenceSink, SinkError};

const UNREPAIRABLE_MESSAGE: &str = "Invalid JSON format - could not fix";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Missing call_id")]
    MissingCallId,
    #[error("ingest queue is full, retry later")]
    QueueFull,
    #[error("dedup ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match self {
            IngestError::MissingCallId => StatusCode::BAD_REQUEST,
            IngestError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(json!({"status": "error", "message": self.to_string()})),
        )
            .into_response()
    }
}

/// What happened to one inbound notification. Every outcome is acknowledged with 200 so
/// the sender does not retry a payload that will never succeed.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { call_id: String },
    Duplicate { call_id: String },
    Malformed { message: String },
}

impl IntoResponse for IngestOutcome {
    fn into_response(self) -> Response {
        let body = match self {
            IngestOutcome::Accepted { .. } => json!({"status": "success"}),
            IngestOutcome::Duplicate { .. } => json!({"status": "duplicate"}),
            IngestOutcome::Malformed { message } => json!({"status": "error", "message": message}),
        };

        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Runs one notification through repair, parse, dedup and persistence.
pub struct Ingestor {
    ledger: DedupLedger,
    sink: Arc<dyn PersistenceSink + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Ingestor {
    pub fn new(
        ledger: DedupLedger,
        sink: Arc<dyn PersistenceSink + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            ledger,
            sink,
            timesource,
        }
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub async fn pending(&self) -> usize {
        self.sink.pending().await
    }

    /// Process a raw request body.
    ///
    /// Store failures on the direct path do not fail the request: the call is still
    /// marked processed and the backfill poller recovers it. A full queue under the
    /// reject policy fails the request without marking, so a redelivery is accepted.
    #[instrument(skip_all, fields(call_id))]
    pub async fn ingest(&self, raw: &str) -> Result<IngestOutcome, IngestError> {
        metrics::counter!("callhook_events_received_total").increment(1);

        let parsed = match parse_payload(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                metrics::counter!("callhook_events_malformed_total").increment(1);
                error!(
                    original = %truncate(&e.original, 500),
                    repaired = %truncate(&e.repaired, 500),
                    "could not repair payload: {}",
                    e.error
                );
                return Ok(IngestOutcome::Malformed {
                    message: UNREPAIRABLE_MESSAGE.to_owned(),
                });
            }
        };
        if parsed.repaired {
            metrics::counter!("callhook_events_repaired_total").increment(1);
        }

        let event = match CallEvent::from_payload(&parsed.value, self.timesource.now()) {
            Ok(event) => event,
            Err(EventError::MissingCallId) => {
                error!(body = %parsed.value, "payload has no call_id");
                return Err(IngestError::MissingCallId);
            }
            Err(e @ EventError::NotAnObject) => {
                metrics::counter!("callhook_events_malformed_total").increment(1);
                error!(body = %parsed.value, "rejected payload: {}", e);
                return Ok(IngestOutcome::Malformed {
                    message: e.to_string(),
                });
            }
        };
        tracing::Span::current().record("call_id", event.call_id.as_str());

        let seen = match self.ledger.is_duplicate(&event.call_id).await {
            Ok(seen) => seen,
            Err(e) => {
                error!(
                    raw = %truncate(raw, 500),
                    body = %parsed.value,
                    "dedup check failed: {}",
                    e
                );
                return Err(e.into());
            }
        };
        if seen {
            metrics::counter!("callhook_events_duplicate_total").increment(1);
            warn!("duplicate call ignored");
            return Ok(IngestOutcome::Duplicate {
                call_id: event.call_id,
            });
        }

        info!(
            caller_id = %event.caller_id,
            campaign = %event.campaign,
            publisher = %event.publisher_name,
            has_value = event.has_value(),
            "processing call"
        );

        match self.sink.persist(&event).await {
            Ok(()) => {}
            Err(SinkError::QueueFull { capacity }) => {
                warn!(capacity, "ingest queue full, refusing call");
                return Err(IngestError::QueueFull);
            }
            Err(SinkError::Store(e)) => {
                metrics::counter!("callhook_persist_failures_total").increment(1);
                error!("failed to write call, leaving it to the backfill: {}", e);
            }
        }

        if let Err(e) = self
            .ledger
            .mark_processed(&event.call_id, self.timesource.now())
            .await
        {
            error!(
                raw = %truncate(raw, 500),
                body = %parsed.value,
                "failed to mark call processed: {}",
                e
            );
            return Err(e.into());
        }
        metrics::counter!("callhook_events_accepted_total").increment(1);

        Ok(IngestOutcome::Accepted {
            call_id: event.call_id,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::queue::IngestQueue;
    use crate::sink::{DirectSink, QueuedSink};
    use async_trait::async_trait;
    use callhook_common::store::{MemoryStore, StoreError, TabularStore};
    use callhook_common::time::FixedTime;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn clock() -> Arc<FixedTime> {
        Arc::new(FixedTime {
            time: Utc.with_ymd_and_hms(2025, 9, 9, 21, 0, 0).unwrap(),
        })
    }

    async fn direct(store: MemoryStore) -> Ingestor {
        let sink = DirectSink::new(
            Arc::new(store),
            "Ringba Raw",
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        Ingestor::new(DedupLedger::in_memory().await.unwrap(), Arc::new(sink), clock())
    }

    struct BrokenStore;

    #[async_trait]
    impl TabularStore for BrokenStore {
        async fn append_rows(&self, _: &str, _: Vec<Vec<Value>>) -> Result<(), StoreError> {
            Err(StoreError::AuthError("expired".to_owned()))
        }
        async fn read_rows(&self, _: &str) -> Result<Vec<Vec<String>>, StoreError> {
            Err(StoreError::AuthError("expired".to_owned()))
        }
        async fn replace_rows(&self, _: &str, _: Vec<Vec<Value>>) -> Result<(), StoreError> {
            Err(StoreError::AuthError("expired".to_owned()))
        }
        async fn header(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::AuthError("expired".to_owned()))
        }
        async fn set_header(&self, _: &str, _: &[&str]) -> Result<(), StoreError> {
            Err(StoreError::AuthError("expired".to_owned()))
        }
    }

    #[tokio::test]
    async fn repaired_payload_is_accepted() {
        let store = MemoryStore::new();
        let ingestor = direct(store.clone()).await;

        let outcome = ingestor
            .ingest(r#"{"call_id":"abc123","did":"(555) 123-4567","durationSec": ,"payout":,"revenue":10.5}"#)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                call_id: "abc123".to_owned()
            }
        );
        let rows = store.rows("Ringba Raw");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][3], json!("5551234567"));
        assert_eq!(rows[1][5], json!(""));
        assert_eq!(rows[1][11], json!(0.0));
        assert!(ingestor.ledger().is_duplicate("abc123").await.unwrap());
    }

    #[tokio::test]
    async fn second_delivery_is_a_duplicate() {
        let store = MemoryStore::new();
        let ingestor = direct(store.clone()).await;
        let body = r#"{"call_id":"CA1","did":"5551234567"}"#;

        ingestor.ingest(body).await.unwrap();
        let outcome = ingestor.ingest(body).await.unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Duplicate {
                call_id: "CA1".to_owned()
            }
        );
        assert_eq!(store.rows("Ringba Raw").len(), 2);
    }

    #[tokio::test]
    async fn unrepairable_payload_is_never_recorded() {
        let store = MemoryStore::new();
        let ingestor = direct(store.clone()).await;

        let outcome = ingestor.ingest(r#"{"call_id":"CA1", "did" 5551234567"#).await.unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Malformed {
                message: UNREPAIRABLE_MESSAGE.to_owned()
            }
        );
        assert_eq!(ingestor.ledger().len().await.unwrap(), 0);
        assert!(store.rows("Ringba Raw").is_empty());
    }

    #[tokio::test]
    async fn missing_call_id_is_rejected() {
        let ingestor = direct(MemoryStore::new()).await;

        assert!(matches!(
            ingestor.ingest(r#"{"did":"5551234567"}"#).await,
            Err(IngestError::MissingCallId)
        ));
        assert_eq!(ingestor.ledger().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_still_marks_processed() {
        let sink = DirectSink::new(
            Arc::new(BrokenStore),
            "Ringba Raw",
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        let ingestor = Ingestor::new(DedupLedger::in_memory().await.unwrap(), Arc::new(sink), clock());

        let outcome = ingestor.ingest(r#"{"call_id":"CA1"}"#).await.unwrap();

        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        assert!(ingestor.ledger().is_duplicate("CA1").await.unwrap());
    }

    #[tokio::test]
    async fn full_queue_does_not_mark_processed() {
        let queue = Arc::new(IngestQueue::new(1, OverflowPolicy::Reject));
        let ingestor = Ingestor::new(
            DedupLedger::in_memory().await.unwrap(),
            Arc::new(QueuedSink::new(queue)),
            clock(),
        );

        ingestor.ingest(r#"{"call_id":"CA1"}"#).await.unwrap();
        assert!(matches!(
            ingestor.ingest(r#"{"call_id":"CA2"}"#).await,
            Err(IngestError::QueueFull)
        ));

        assert_eq!(ingestor.pending().await, 1);
        assert!(!ingestor.ledger().is_duplicate("CA2").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_failure_is_an_internal_error() {
        let store = MemoryStore::new();
        let ingestor = direct(store.clone()).await;
        ingestor.ledger().close().await;

        let result = ingestor.ingest(r#"{"call_id":"CA1"}"#).await;

        assert!(matches!(result, Err(IngestError::Ledger(_))));
        let response = result.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(store.rows("Ringba Raw").is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
