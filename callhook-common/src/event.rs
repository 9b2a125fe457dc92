use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::America::New_York;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::normalize::canonical_did;

/// Column layout of the event table. Every ingestion path writes exactly these columns,
/// in this order.
pub const EVENT_COLUMNS: [&str; 16] = [
    "call_id",
    "call_start_utc",
    "did_raw",
    "did_canon",
    "caller_id",
    "duration_sec",
    "disposition",
    "campaign",
    "target",
    "publisher_id",
    "publisher_name",
    "payout",
    "revenue",
    "_ingested_at",
    "Date",
    "Time",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no call_id")]
    MissingCallId,
}

/// One call notification, as written to the event table.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub call_id: String,
    pub call_start_utc: String,
    pub did_raw: String,
    pub did_canon: String,
    pub caller_id: String,
    pub duration_sec: Option<i64>,
    pub disposition: Option<String>,
    pub campaign: String,
    pub target: String,
    pub publisher_id: String,
    pub publisher_name: String,
    pub payout: f64,
    pub revenue: f64,
    pub ingested_at: DateTime<Utc>,
}

impl CallEvent {
    /// Build an event from a webhook body. Only `call_id` is required; everything else
    /// defaults to empty or zero.
    pub fn from_payload(payload: &Value, ingested_at: DateTime<Utc>) -> Result<Self, EventError> {
        let body = payload.as_object().ok_or(EventError::NotAnObject)?;

        let call_id = text(body, "call_id");
        if call_id.is_empty() {
            return Err(EventError::MissingCallId);
        }

        let did_raw = text(body, "did");
        let campaign = match text(body, "campaignName") {
            name if name.is_empty() => text(body, "campaignId"),
            name => name,
        };
        let disposition = Some(text(body, "disposition")).filter(|value| !value.is_empty());

        Ok(CallEvent {
            call_id,
            call_start_utc: text(body, "callStartUtc"),
            did_canon: canonical_did(&did_raw),
            did_raw,
            caller_id: text(body, "callerId"),
            duration_sec: integer(body, "durationSec"),
            disposition,
            campaign,
            target: text(body, "target").trim().to_owned(),
            publisher_id: text(body, "publisherId"),
            publisher_name: text(body, "publisherName"),
            payout: amount(body, "payout"),
            revenue: amount(body, "revenue"),
            ingested_at,
        })
    }

    /// Whether the call carries any monetary value. Calls without value are still written.
    pub fn has_value(&self) -> bool {
        !self.target.is_empty() && self.payout != 0.0 && self.revenue != 0.0
    }

    /// Render the event in `EVENT_COLUMNS` order.
    pub fn to_row(&self) -> Vec<Value> {
        let (date, time) = match parse_call_start(&self.call_start_utc) {
            Some(start) => {
                let local = start.with_timezone(&New_York);
                (
                    local.format("%-m/%-d/%Y").to_string(),
                    local.format("%-I:%M %p").to_string(),
                )
            }
            None => (String::new(), String::new()),
        };

        vec![
            Value::from(self.call_id.as_str()),
            Value::from(self.call_start_utc.as_str()),
            Value::from(self.did_raw.as_str()),
            Value::from(self.did_canon.as_str()),
            Value::from(self.caller_id.as_str()),
            self.duration_sec.map_or_else(|| Value::from(""), Value::from),
            Value::from(self.disposition.as_deref().unwrap_or_default()),
            Value::from(self.campaign.as_str()),
            Value::from(self.target.as_str()),
            Value::from(self.publisher_id.as_str()),
            Value::from(self.publisher_name.as_str()),
            Value::from(self.payout),
            Value::from(self.revenue),
            Value::from(
                self.ingested_at
                    .to_rfc3339_opts(SecondsFormat::Micros, false),
            ),
            Value::from(date),
            Value::from(time),
        ]
    }
}

/// Parse a source timestamp. The platform sends RFC 3339 (`2025-09-09T20:43:09Z`), but
/// older exports used `2025-09-09 20:43:09`, which is taken as UTC.
pub fn parse_call_start(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn text(body: &Map<String, Value>, key: &str) -> String {
    match body.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Number(value)) => value.to_string(),
        Some(Value::Bool(value)) => value.to_string(),
        _ => String::new(),
    }
}

fn integer(body: &Map<String, Value>, key: &str) -> Option<i64> {
    match body.get(key)? {
        Value::Number(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|float| float.trunc() as i64)),
        Value::String(value) => {
            let value = value.trim();
            value
                .parse::<i64>()
                .ok()
                .or_else(|| value.parse::<f64>().ok().map(|float| float.trunc() as i64))
        }
        _ => None,
    }
}

fn amount(body: &Map<String, Value>, key: &str) -> f64 {
    let parsed = match body.get(key) {
        Some(Value::Number(value)) => value.as_f64(),
        Some(Value::String(value)) => value.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed.filter(|value| value.is_finite()).unwrap_or(0.0)
}
