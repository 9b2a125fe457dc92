use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Url};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

const REPORT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const MAX_RESULTS_PER_GROUP: u32 = 10_000;

/// Report columns in the order they come back in a positional `values` array, paired with
/// the webhook key each one maps to and the alternate names some report shapes use.
const VALUE_COLUMNS: [(&str, &str, &[&str]); 11] = [
    ("callStartUtc", "callStartUtc", &["call_start_utc"]),
    ("did", "did", &["did_raw"]),
    ("callerId", "callerId", &["caller_id"]),
    ("callLengthInSeconds", "durationSec", &["duration_sec"]),
    ("disposition", "disposition", &[]),
    ("campaignName", "campaignName", &["campaign"]),
    ("target", "target", &[]),
    ("publisherId", "publisherId", &["publisher_id"]),
    ("publisherName", "publisherName", &["publisher_name"]),
    ("payoutAmount", "payout", &["payout"]),
    ("conversionAmount", "revenue", &["revenue"]),
];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid ringba api url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to ringba failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("ringba returned {status}: {body}")]
    BadStatus { status: u16, body: String },
}

/// Where the backfill reads historical calls from.
#[async_trait]
pub trait CallSource {
    /// Calls that started in `[start, end]`, each shaped like a webhook body so it can go
    /// through the same event parsing.
    async fn fetch_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>, SourceError>;
}

/// Client for the Ringba insights report, grouped by call id.
pub struct InsightsClient {
    client: reqwest::Client,
    report_url: Url,
    token: String,
}

impl InsightsClient {
    pub fn new(
        base_url: &str,
        account_id: &str,
        token: &str,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let invalid = |reason: String| SourceError::InvalidUrl {
            url: base_url.to_owned(),
            reason,
        };
        let mut report_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        report_url
            .path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_owned()))?
            .pop_if_empty()
            .push(account_id)
            .push("insights");

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("callhook-backfill")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            report_url,
            token: token.to_owned(),
        })
    }

    fn report_request(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
        let value_columns: Vec<Value> = VALUE_COLUMNS
            .iter()
            .map(|(column, _, _)| json!({"column": column, "aggregateFunction": null}))
            .collect();

        json!({
            "reportStart": start.format(REPORT_TIME_FORMAT).to_string(),
            "reportEnd": end.format(REPORT_TIME_FORMAT).to_string(),
            "groupByColumns": [{"column": "callId", "displayName": "Call ID"}],
            "valueColumns": value_columns,
            "orderByColumns": [{"column": "callStartUtc", "direction": "desc"}],
            "formatTimeZone": "America/New_York",
            "maxResultsPerGroup": MAX_RESULTS_PER_GROUP,
            "filters": [],
        })
    }
}

#[async_trait]
impl CallSource for InsightsClient {
    async fn fetch_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>, SourceError> {
        let response = self
            .client
            .post(self.report_url.clone())
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .json(&Self::report_request(start, end))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let report: Value = response.json().await?;
        let calls = parse_report(&report);
        debug!(calls = calls.len(), %start, %end, "fetched insights report");

        Ok(calls)
    }
}

/// Pull the records out of an insights response. Depending on the report version they
/// live under `report.records`, `data.rows` or a top-level `rows`.
pub fn parse_report(report: &Value) -> Vec<Value> {
    let records = report
        .pointer("/report/records")
        .or_else(|| report.pointer("/data/rows"))
        .or_else(|| report.get("rows"))
        .and_then(Value::as_array);

    let Some(records) = records else {
        warn!("insights response has no records");
        return Vec::new();
    };

    records.iter().filter_map(record_to_payload).collect()
}

/// Reshape one report record into webhook keys. Records without a call id are skipped.
fn record_to_payload(record: &Value) -> Option<Value> {
    let call_id = record
        .pointer("/groupByValues/0")
        .or_else(|| record.get("callId"))
        .or_else(|| record.get("call_id"))
        .map(scalar_text)
        .filter(|id| !id.is_empty())?;

    let mut payload = Map::new();
    payload.insert("call_id".to_owned(), Value::from(call_id));

    match record.get("values").and_then(Value::as_array) {
        Some(values) => {
            for ((_, key, _), value) in VALUE_COLUMNS.iter().zip(values) {
                payload.insert((*key).to_owned(), value.clone());
            }
        }
        None => {
            for (column, key, aliases) in VALUE_COLUMNS {
                let value = std::iter::once(column)
                    .chain(aliases.iter().copied())
                    .find_map(|name| record.get(name).filter(|v| !v.is_null()));
                if let Some(value) = value {
                    payload.insert(key.to_owned(), value.clone());
                }
            }
        }
    }

    Some(Value::Object(payload))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;

    #[test]
    fn positional_values() {
        let report = json!({
            "report": {"records": [{
                "groupByValues": ["CA1"],
                "values": [
                    "2025-09-09T20:43:09Z", "+15551234567", "5559990000", 94, "Completed",
                    "Medicare", "Buyer A", "PUB1", "Publisher One", 12.5, 40,
                ],
            }]}
        });

        assert_eq!(
            parse_report(&report),
            vec![json!({
                "call_id": "CA1",
                "callStartUtc": "2025-09-09T20:43:09Z",
                "did": "+15551234567",
                "callerId": "5559990000",
                "durationSec": 94,
                "disposition": "Completed",
                "campaignName": "Medicare",
                "target": "Buyer A",
                "publisherId": "PUB1",
                "publisherName": "Publisher One",
                "payout": 12.5,
                "revenue": 40,
            })]
        );
    }

    #[test]
    fn keyed_rows_use_alternate_names() {
        let report = json!({
            "data": {"rows": [
                {
                    "callId": "CA2",
                    "call_start_utc": "2025-09-09 20:43:09",
                    "did_raw": "5551234567",
                    "campaign": "ACA",
                    "publisher_name": "Publisher Two",
                    "payout": 3,
                },
                {"did": "5550000000"},
            ]}
        });

        assert_eq!(
            parse_report(&report),
            vec![json!({
                "call_id": "CA2",
                "callStartUtc": "2025-09-09 20:43:09",
                "did": "5551234567",
                "campaignName": "ACA",
                "publisherName": "Publisher Two",
                "payout": 3,
            })]
        );
    }

    #[test]
    fn unknown_shape_is_empty() {
        assert!(parse_report(&json!({"status": "ok"})).is_empty());
        assert_eq!(parse_report(&json!({"rows": [{"call_id": 77}]})).len(), 1);
    }

    #[tokio::test]
    async fn posts_report_request() {
        let server = MockServer::start();
        let start = Utc.with_ymd_and_hms(2025, 9, 9, 20, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 9, 9, 21, 0, 0).unwrap();

        let insights = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/RA123/insights")
                .header("authorization", "Token secret")
                .json_body_partial(
                    r#"{
                        "reportStart": "2025-09-09T20:00:00Z",
                        "reportEnd": "2025-09-09T21:00:00Z",
                        "groupByColumns": [{"column": "callId", "displayName": "Call ID"}],
                        "formatTimeZone": "America/New_York"
                    }"#,
                );
            then.status(200)
                .json_body(json!({"rows": [{"callId": "CA1", "did": "5551234567"}]}));
        });

        let client =
            InsightsClient::new(&server.url("/v2"), "RA123", "secret", Duration::from_secs(5))
                .unwrap();
        let calls = client.fetch_calls(start, end).await.unwrap();

        insights.assert();
        assert_eq!(calls, vec![json!({"call_id": "CA1", "did": "5551234567"})]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(401).body("bad token");
        });

        let client =
            InsightsClient::new(&server.url("/v2"), "RA123", "wrong", Duration::from_secs(5))
                .unwrap();
        let now = Utc::now();

        match client.fetch_calls(now, now).await {
            Err(SourceError::BadStatus { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected result: {:?}", other.map(|calls| calls.len())),
        }
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(matches!(
            InsightsClient::new("not a url", "RA123", "t", Duration::from_secs(1)),
            Err(SourceError::InvalidUrl { .. })
        ));
    }
}
