use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use callhook_common::config::CampaignWhitelist;
use callhook_common::event::{parse_call_start, CallEvent, EVENT_COLUMNS};
use callhook_common::store::{ensure_header, with_timeout, StoreError, TabularStore};
use callhook_common::time::TimeSource;

use crate::ringba::{CallSource, SourceError};

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct PollSettings {
    pub table: String,
    /// How far back to start when the event table is empty.
    pub lookback: Duration,
    /// Re-read this much before the latest stored call on start.
    pub resume_overlap: Duration,
    /// Each window starts this long before the previous one ended.
    pub window_overlap: Duration,
    pub store_timeout: Duration,
}

/// What the event table already holds.
#[derive(Debug, Default, PartialEq)]
pub struct TableState {
    pub call_ids: HashSet<String>,
    pub latest_start: Option<DateTime<Utc>>,
}

impl TableState {
    /// Column A holds call ids and column B start times; row 0 is the header.
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut state = TableState::default();

        for row in rows.iter().skip(1) {
            if let Some(call_id) = row.first().map(|id| id.trim()).filter(|id| !id.is_empty()) {
                state.call_ids.insert(call_id.to_owned());
            }
            if let Some(start) = row.get(1).and_then(|cell| parse_call_start(cell)) {
                state.latest_start = state.latest_start.max(Some(start));
            }
        }

        state
    }
}

/// Pulls calls the webhook may have missed and appends the new ones to the event table.
pub struct Poller {
    source: Arc<dyn CallSource + Send + Sync>,
    store: Arc<dyn TabularStore + Send + Sync>,
    campaigns: CampaignWhitelist,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    settings: PollSettings,
    known: HashSet<String>,
    window_start: DateTime<Utc>,
}

impl Poller {
    /// Read the event table to learn which calls are already stored and where to resume.
    /// An unreadable table is an error: starting empty would append the whole lookback
    /// window again.
    pub async fn bootstrap(
        source: Arc<dyn CallSource + Send + Sync>,
        store: Arc<dyn TabularStore + Send + Sync>,
        campaigns: CampaignWhitelist,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        settings: PollSettings,
    ) -> Result<Self, BackfillError> {
        let table = settings.table.as_str();
        let rows = with_timeout(
            "read",
            table,
            settings.store_timeout,
            store.read_rows(table),
        )
        .await?;
        let state = TableState::from_rows(&rows);

        let now = timesource.now();
        let window_start = match state.latest_start {
            Some(latest) => latest - settings.resume_overlap,
            None => now - settings.lookback,
        };
        info!(
            known = state.call_ids.len(),
            %window_start,
            "backfill resuming"
        );

        Ok(Self {
            source,
            store,
            campaigns,
            timesource,
            settings,
            known: state.call_ids,
            window_start,
        })
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    /// Fetch the window from `window_start` to now and append calls not seen before.
    /// The window only advances when the whole pass succeeds, so a failed pass is
    /// retried from the same start.
    #[instrument(skip_all, fields(start = %self.window_start))]
    pub async fn poll_once(&mut self) -> Result<usize, BackfillError> {
        let end = self.timesource.now();
        let payloads = self.source.fetch_calls(self.window_start, end).await?;
        metrics::counter!("callhook_backfill_fetched_total").increment(payloads.len() as u64);

        let mut batch_ids = HashSet::new();
        let fresh: Vec<CallEvent> = payloads
            .iter()
            .filter_map(|payload| CallEvent::from_payload(payload, end).ok())
            .filter(|event| self.campaigns.admits(&event.campaign))
            .filter(|event| !self.known.contains(&event.call_id))
            .filter(|event| batch_ids.insert(event.call_id.clone()))
            .collect();

        if !fresh.is_empty() {
            let table = self.settings.table.as_str();
            let timeout = self.settings.store_timeout;
            with_timeout(
                "header",
                table,
                timeout,
                ensure_header(self.store.as_ref(), table, &EVENT_COLUMNS),
            )
            .await?;

            let rows = fresh.iter().map(CallEvent::to_row).collect();
            with_timeout("append", table, timeout, self.store.append_rows(table, rows)).await?;

            metrics::counter!("callhook_backfill_written_total").increment(fresh.len() as u64);
            info!(calls = fresh.len(), "backfilled calls");
        }

        self.known.extend(batch_ids);
        self.window_start = end - self.settings.window_overlap;

        Ok(fresh.len())
    }

    /// Poll every `interval` until `shutdown` fires. Errors are logged and the next
    /// pass retries the same window.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        loop {
            match self.poll_once().await {
                Ok(count) => {
                    metrics::gauge!("callhook_backfill_last_success_timestamp")
                        .set(self.timesource.now().timestamp() as f64);
                    if count == 0 {
                        info!("no new calls");
                    }
                }
                Err(e) => {
                    metrics::counter!("callhook_backfill_errors_total").increment(1);
                    error!("backfill pass failed: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("backfill poller stopped");
    }
}
