use std::str::FromStr;

use envconfig::Envconfig;

use callhook_common::config::{CampaignWhitelist, ConfigError, EnvMsDuration, SpreadsheetId};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(from = "MASTER_CPA_DATA")]
    pub spreadsheet: Option<String>,

    #[envconfig(from = "GOOGLE_CREDENTIALS_JSON")]
    pub google_credentials_json: Option<String>,

    #[envconfig(from = "SHEETS_ACCESS_TOKEN")]
    pub sheets_access_token: Option<String>,

    #[envconfig(from = "SHEETS_API_URL", default = "https://sheets.googleapis.com/v4")]
    pub sheets_api_url: String,

    #[envconfig(from = "RINGBA_CAMPAIGNS", default = "")]
    pub campaigns: CampaignWhitelist,

    #[envconfig(
        from = "DEDUP_DATABASE_URL",
        default = "sqlite:///tmp/ringba.sqlite?mode=rwc"
    )]
    pub dedup_database_url: String,

    #[envconfig(from = "DEDUP_RETENTION_DAYS")]
    pub dedup_retention_days: Option<u32>,

    #[envconfig(from = "DEDUP_JANITOR_INTERVAL", default = "3600000")]
    pub dedup_janitor_interval: EnvMsDuration,

    #[envconfig(from = "PERSISTENCE_MODE", default = "direct")]
    pub persistence_mode: PersistenceMode,

    #[envconfig(from = "QUEUE_CAPACITY", default = "100")]
    pub queue_capacity: usize,

    #[envconfig(from = "QUEUE_OVERFLOW", default = "reject")]
    pub queue_overflow: OverflowPolicy,

    #[envconfig(from = "BATCH_SIZE", default = "25")]
    pub batch_size: usize,

    #[envconfig(from = "FLUSH_INTERVAL", default = "2000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "HEADER_TIMEOUT", default = "5000")]
    pub header_timeout: EnvMsDuration,

    #[envconfig(from = "APPEND_TIMEOUT", default = "10000")]
    pub append_timeout: EnvMsDuration,

    #[envconfig(from = "FAILURE_BACKOFF", default = "5000")]
    pub failure_backoff: EnvMsDuration,

    #[envconfig(from = "REALTIME_REFRESH_INTERVAL", default = "300000")]
    pub realtime_refresh_interval: EnvMsDuration,

    #[envconfig(from = "STORE_TIMEOUT", default = "30000")]
    pub store_timeout: EnvMsDuration,

    #[envconfig(from = "TIMESTAMP_ORDERING", default = "parsed")]
    pub timestamp_ordering: TimestampOrdering,

    #[envconfig(from = "RAW_TABLE", default = "Ringba Raw")]
    pub raw_table: String,

    #[envconfig(from = "REALTIME_TABLE", default = "Real Time")]
    pub realtime_table: String,

    #[envconfig(from = "MAP_TABLE", default = "DID Publisher Map")]
    pub map_table: String,

    #[envconfig(from = "COUNTS_TABLE", default = "Publisher DID Counts")]
    pub counts_table: String,

    #[envconfig(from = "EXPORT_PROMETHEUS", default = "true")]
    pub export_prometheus: bool,

    #[envconfig(from = "MEMORY_STORE", default = "false")]
    pub memory_store: bool,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check everything a running service depends on. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.memory_store {
            self.spreadsheet_id()?;

            let has_credentials = [&self.google_credentials_json, &self.sheets_access_token]
                .iter()
                .any(|value| value.as_deref().is_some_and(|v| !v.trim().is_empty()));
            if !has_credentials {
                return Err(ConfigError::Missing(
                    "GOOGLE_CREDENTIALS_JSON or SHEETS_ACCESS_TOKEN",
                ));
            }
        }

        if self.sheets_api_url.trim().is_empty() {
            return Err(ConfigError::Missing("SHEETS_API_URL"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "QUEUE_CAPACITY",
                value: "0".to_owned(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                value: "0".to_owned(),
            });
        }
        if self.dedup_retention_days == Some(0) {
            return Err(ConfigError::Invalid {
                name: "DEDUP_RETENTION_DAYS",
                value: "0".to_owned(),
            });
        }
        for (name, table) in [
            ("RAW_TABLE", &self.raw_table),
            ("REALTIME_TABLE", &self.realtime_table),
            ("MAP_TABLE", &self.map_table),
            ("COUNTS_TABLE", &self.counts_table),
        ] {
            if table.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        Ok(())
    }

    pub fn spreadsheet_id(&self) -> Result<SpreadsheetId, ConfigError> {
        let raw = self
            .spreadsheet
            .as_deref()
            .ok_or(ConfigError::Missing("MASTER_CPA_DATA"))?;

        SpreadsheetId::from_str(raw).map_err(|_| ConfigError::Missing("MASTER_CPA_DATA"))
    }

    /// Whether a remote store can be built from this configuration.
    pub fn store_configured(&self) -> bool {
        !self.memory_store
            && self.spreadsheet_id().is_ok()
            && (self.google_credentials_json.is_some() || self.sheets_access_token.is_some())
    }
}

/// How accepted events reach the event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Append synchronously inside the request.
    Direct,
    /// Stage in the bounded queue, drained by the batch writer.
    Queued,
}

/// What the bounded queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new row.
    Reject,
    /// Evict the oldest pending row to make room.
    DropOldest,
}

/// How reconciliation compares start timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampOrdering {
    /// Compare as instants when both sides parse, as text otherwise.
    Parsed,
    /// Compare the raw text.
    Lexical,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseModeError(pub String);

impl std::fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown mode: {}", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for PersistenceMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(PersistenceMode::Direct),
            "queued" => Ok(PersistenceMode::Queued),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}

impl FromStr for TimestampOrdering {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parsed" => Ok(TimestampOrdering::Parsed),
            "lexical" => Ok(TimestampOrdering::Lexical),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}
