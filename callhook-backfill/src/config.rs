use envconfig::Envconfig;

use callhook_common::config::{
    CampaignWhitelist, ConfigError, EnvMsDuration, NonEmptyString, SpreadsheetId,
};

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8001")]
    pub port: u16,

    #[envconfig(from = "RINGBA_API_TOKEN")]
    pub ringba_api_token: NonEmptyString,

    #[envconfig(from = "RINGBA_ACCOUNT_ID")]
    pub ringba_account_id: NonEmptyString,

    #[envconfig(from = "RINGBA_API_URL", default = "https://api.ringba.com/v2")]
    pub ringba_api_url: String,

    #[envconfig(from = "MASTER_CPA_DATA")]
    pub spreadsheet: SpreadsheetId,

    #[envconfig(from = "GOOGLE_CREDENTIALS_JSON")]
    pub google_credentials_json: Option<String>,

    #[envconfig(from = "SHEETS_ACCESS_TOKEN")]
    pub sheets_access_token: Option<String>,

    #[envconfig(from = "SHEETS_API_URL", default = "https://sheets.googleapis.com/v4")]
    pub sheets_api_url: String,

    #[envconfig(from = "SHEET_NAME", default = "Ringba Raw")]
    pub sheet_name: String,

    #[envconfig(from = "POLL_INTERVAL", default = "60000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "LOOKBACK_HOURS", default = "24")]
    pub lookback_hours: u32,

    #[envconfig(from = "RESUME_OVERLAP", default = "300000")]
    pub resume_overlap: EnvMsDuration,

    #[envconfig(from = "WINDOW_OVERLAP", default = "60000")]
    pub window_overlap: EnvMsDuration,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "RINGBA_CAMPAIGNS", default = "")]
    pub campaigns: CampaignWhitelist,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_credentials = [&self.google_credentials_json, &self.sheets_access_token]
            .iter()
            .any(|value| value.as_deref().is_some_and(|v| !v.trim().is_empty()));
        if !has_credentials {
            return Err(ConfigError::Missing(
                "GOOGLE_CREDENTIALS_JSON or SHEETS_ACCESS_TOKEN",
            ));
        }
        if self.ringba_api_url.trim().is_empty() {
            return Err(ConfigError::Missing("RINGBA_API_URL"));
        }
        if self.sheet_name.trim().is_empty() {
            return Err(ConfigError::Missing("SHEET_NAME"));
        }
        if self.poll_interval.0.is_zero() {
            return Err(ConfigError::Invalid {
                name: "POLL_INTERVAL",
                value: "0".to_owned(),
            });
        }

        Ok(())
    }
}
