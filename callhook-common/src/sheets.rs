use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, Url};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::TokenSource;
use crate::config::SpreadsheetId;
use crate::store::{cell_text, StoreError, TabularStore};

/// Every table we own fits in columns A through P.
const FULL_SPAN: &str = "A:P";
const HEADER_SPAN: &str = "A1:P1";
const ORIGIN: &str = "A1";

#[derive(Serialize, Deserialize, Default)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// `TabularStore` over the Google Sheets v4 values API. Each table is a tab of one
/// spreadsheet.
pub struct SheetsClient {
    client: reqwest::Client,
    base_url: Url,
    spreadsheet: SpreadsheetId,
    tokens: Arc<dyn TokenSource + Send + Sync>,
}

impl SheetsClient {
    pub fn new(
        base_url: &str,
        spreadsheet: SpreadsheetId,
        tokens: Arc<dyn TokenSource + Send + Sync>,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidUrl {
            url: base_url.to_owned(),
            reason,
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("cannot be a base".to_owned()));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("callhook")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            spreadsheet,
            tokens,
        })
    }

    /// A1 notation for `span` on the `table` tab. Tab names are quoted so spaces survive.
    fn range(table: &str, span: &str) -> String {
        format!("'{}'!{}", table.replace('\'', "''"), span)
    }

    fn values_url(&self, range: &str, action: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let segment = match action {
            Some(action) => format!("{range}:{action}"),
            None => range.to_owned(),
        };
        // `new` rejects cannot-be-a-base urls, so the segments are always available.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("spreadsheets")
                .push(self.spreadsheet.as_str())
                .push("values")
                .push(&segment);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<&ValueRange>,
    ) -> Result<ValueRange, StoreError> {
        let token = self.tokens.token().await?;
        let mut request = self
            .client
            .request(method, url)
            .query(query)
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(ValueRange::default());
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<Value>>, StoreError> {
        let url = self.values_url(range, None);
        let response = self.send(Method::GET, url, &[], None).await?;
        Ok(response.values)
    }

    async fn update_values(&self, range: &str, values: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let url = self.values_url(range, None);
        let body = ValueRange { values };
        self.send(Method::PUT, url, &[("valueInputOption", "RAW")], Some(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TabularStore for SheetsClient {
    async fn append_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let count = rows.len();
        let url = self.values_url(&Self::range(table, FULL_SPAN), Some("append"));
        let body = ValueRange { values: rows };
        self.send(
            Method::POST,
            url,
            &[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ],
            Some(&body),
        )
        .await?;

        debug!(table, rows = count, "appended rows");
        Ok(())
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let values = self.get_values(&Self::range(table, FULL_SPAN)).await?;
        Ok(values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn replace_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let count = rows.len();
        let clear = self.values_url(&Self::range(table, FULL_SPAN), Some("clear"));
        self.send(Method::POST, clear, &[], None).await?;
        self.update_values(&Self::range(table, ORIGIN), rows).await?;

        info!(table, rows = count, "replaced table contents");
        Ok(())
    }

    async fn header(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let values = self.get_values(&Self::range(table, HEADER_SPAN)).await?;
        Ok(values
            .first()
            .map(|row| row.iter().map(cell_text).collect())
            .unwrap_or_default())
    }

    async fn set_header(&self, table: &str, header: &[&str]) -> Result<(), StoreError> {
        let row = header.iter().copied().map(Value::from).collect();
        self.update_values(&Self::range(table, HEADER_SPAN), vec![row])
            .await
    }
}
