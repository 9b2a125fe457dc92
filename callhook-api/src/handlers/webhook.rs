use axum::extract::State;
use bytes::Bytes;
use tracing::debug;

use crate::ingest::{IngestError, IngestOutcome};

use super::AppState;

/// Inbound call notification. The body is read raw so malformed JSON can be repaired.
pub async fn post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<IngestOutcome, IngestError> {
    let raw = String::from_utf8_lossy(&body);
    debug!(body = %raw, "received webhook");

    state.ingestor.ingest(&raw).await
}
