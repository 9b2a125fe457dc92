use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::SecondsFormat;
use serde_derive::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument};

use callhook_common::config::CampaignWhitelist;
use callhook_common::event::parse_call_start;
use callhook_common::normalize::canonical_did;
use callhook_common::store::{with_timeout, StoreError, TabularStore};
use callhook_common::time::TimeSource;

use crate::config::TimestampOrdering;
use crate::realtime::RealtimeCache;

pub const MAP_COLUMNS: [&str; 4] = [
    "did_canon",
    "publisher_name",
    "publisher_id",
    "last_seen_call_start",
];
pub const COUNTS_COLUMNS: [&str; 3] = ["publisher", "did_count", "last_refreshed"];

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("no data found in {table}")]
    NoEvents { table: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> Response {
        let status = match self {
            ReconcileError::NoEvents { .. } => StatusCode::BAD_REQUEST,
            ReconcileError::Store(_) => StatusCode::BAD_GATEWAY,
        };

        (
            status,
            Json(json!({"status": "error", "message": self.to_string()})),
        )
            .into_response()
    }
}

/// The most recent eligible call seen for one DID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub publisher_name: String,
    pub publisher_id: String,
    pub last_seen_call_start: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Mapping {
    pub entries: BTreeMap<String, MappingEntry>,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub did_count: usize,
    pub publisher_count: usize,
}

/// Positions of the columns reconciliation reads, found by header name with the
/// standard layout as fallback.
struct Columns {
    call_start: usize,
    did_canon: usize,
    campaign: usize,
    publisher_id: usize,
    publisher_name: usize,
}

impl Columns {
    fn locate(header: &[String]) -> Self {
        let find = |name: &str, fallback: usize| {
            header
                .iter()
                .position(|column| column == name)
                .unwrap_or(fallback)
        };

        Columns {
            call_start: find("call_start_utc", 1),
            did_canon: find("did_canon", 3),
            campaign: find("campaign", 7),
            publisher_id: find("publisher_id", 9),
            publisher_name: find("publisher_name", 10),
        }
    }

    fn widest(&self) -> usize {
        [
            self.call_start,
            self.did_canon,
            self.campaign,
            self.publisher_id,
            self.publisher_name,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

fn is_later(candidate: &str, current: &str, ordering: TimestampOrdering) -> bool {
    match ordering {
        TimestampOrdering::Lexical => candidate > current,
        TimestampOrdering::Parsed => {
            match (parse_call_start(candidate), parse_call_start(current)) {
                (Some(candidate), Some(current)) => candidate > current,
                _ => candidate > current,
            }
        }
    }
}

/// Latest-call-wins mapping from eligible DIDs to publishers, plus per-publisher counts.
///
/// A row is admitted when its DID is in `eligible` and its campaign passes `campaigns`.
/// The first admitted row for a DID sets its entry; later rows replace it only when
/// their start is strictly later.
pub fn build_mapping(
    header: &[String],
    rows: &[Vec<String>],
    eligible: &HashSet<String>,
    campaigns: &CampaignWhitelist,
    ordering: TimestampOrdering,
) -> Mapping {
    let columns = Columns::locate(header);
    let widest = columns.widest();
    let mut entries: BTreeMap<String, MappingEntry> = BTreeMap::new();

    for row in rows {
        // Partially written rows.
        if row.len() <= widest {
            continue;
        }

        let did = canonical_did(&row[columns.did_canon]);
        let campaign = row[columns.campaign].trim();
        if !eligible.contains(&did) || !campaigns.admits(campaign) {
            continue;
        }

        let call_start = row[columns.call_start].as_str();
        let replace = match entries.get(&did) {
            Some(current) => is_later(call_start, &current.last_seen_call_start, ordering),
            None => true,
        };

        if replace {
            entries.insert(
                did,
                MappingEntry {
                    publisher_name: row[columns.publisher_name].trim().to_owned(),
                    publisher_id: row[columns.publisher_id].trim().to_owned(),
                    last_seen_call_start: call_start.to_owned(),
                },
            );
        }
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries.values() {
        *counts.entry(entry.publisher_name.clone()).or_default() += 1;
    }

    Mapping { entries, counts }
}

pub struct ReconcileTables {
    pub events: String,
    pub map: String,
    pub counts: String,
}

/// Rebuilds the DID map and publisher count tables from the event table.
pub struct Reconciler {
    store: Arc<dyn TabularStore + Send + Sync>,
    cache: Arc<RealtimeCache>,
    campaigns: CampaignWhitelist,
    ordering: TimestampOrdering,
    tables: ReconcileTables,
    timeout: Duration,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TabularStore + Send + Sync>,
        cache: Arc<RealtimeCache>,
        campaigns: CampaignWhitelist,
        ordering: TimestampOrdering,
        tables: ReconcileTables,
        timeout: Duration,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            store,
            cache,
            campaigns,
            ordering,
            tables,
            timeout,
            timesource,
        }
    }

    /// Run one reconciliation. Both derived tables are replaced wholesale, map first; a
    /// failure on the counts table leaves the map updated, and re-running repairs it.
    #[instrument(skip_all, fields(did_count, publisher_count))]
    pub async fn run(&self) -> Result<ReconcileSummary, ReconcileError> {
        let events = self.tables.events.as_str();
        let rows = with_timeout("read", events, self.timeout, self.store.read_rows(events)).await?;

        let Some((header, rows)) = rows.split_first() else {
            return Err(ReconcileError::NoEvents {
                table: events.to_owned(),
            });
        };
        if rows.is_empty() {
            return Err(ReconcileError::NoEvents {
                table: events.to_owned(),
            });
        }

        let eligible = self.cache.snapshot();
        let mapping = build_mapping(header, rows, &eligible, &self.campaigns, self.ordering);

        let mut map_rows: Vec<Vec<Value>> = Vec::with_capacity(mapping.entries.len() + 1);
        map_rows.push(MAP_COLUMNS.iter().copied().map(Value::from).collect());
        for (did, entry) in &mapping.entries {
            map_rows.push(vec![
                Value::from(did.as_str()),
                Value::from(entry.publisher_name.as_str()),
                Value::from(entry.publisher_id.as_str()),
                Value::from(entry.last_seen_call_start.as_str()),
            ]);
        }

        let refreshed = self
            .timesource
            .now()
            .to_rfc3339_opts(SecondsFormat::Micros, false);
        let mut count_rows: Vec<Vec<Value>> = Vec::with_capacity(mapping.counts.len() + 1);
        count_rows.push(COUNTS_COLUMNS.iter().copied().map(Value::from).collect());
        for (publisher, count) in &mapping.counts {
            count_rows.push(vec![
                Value::from(publisher.as_str()),
                Value::from(*count),
                Value::from(refreshed.as_str()),
            ]);
        }

        let map = self.tables.map.as_str();
        with_timeout("replace", map, self.timeout, self.store.replace_rows(map, map_rows)).await?;
        let counts = self.tables.counts.as_str();
        with_timeout(
            "replace",
            counts,
            self.timeout,
            self.store.replace_rows(counts, count_rows),
        )
        .await?;

        let summary = ReconcileSummary {
            did_count: mapping.entries.len(),
            publisher_count: mapping.counts.len(),
        };
        tracing::Span::current().record("did_count", summary.did_count);
        tracing::Span::current().record("publisher_count", summary.publisher_count);
        info!(
            did_count = summary.did_count,
            publisher_count = summary.publisher_count,
            "refreshed DID map"
        );

        Ok(summary)
    }
}
