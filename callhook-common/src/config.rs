//! Value types shared by the `Envconfig` structs of every callhook process.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SPREADSHEET_URL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/d/([a-zA-Z0-9_-]+)").unwrap());

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Campaigns admitted by reconciliation and the backfill poller.
/// An empty whitelist admits every campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignWhitelist(BTreeSet<String>);

impl CampaignWhitelist {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn admits(&self, campaign: &str) -> bool {
        self.0.is_empty() || self.0.contains(campaign)
    }

    pub fn campaigns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromStr for CampaignWhitelist {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CampaignWhitelist(
            s.split(',')
                .map(str::trim)
                .filter(|campaign| !campaign.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

impl<S: Into<String>> FromIterator<S> for CampaignWhitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        CampaignWhitelist(iter.into_iter().map(Into::into).collect())
    }
}

/// The spreadsheet all tables live in. Accepts either the bare id or a sharing URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetId(String);

impl SpreadsheetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpreadsheetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpreadsheetId {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(StringIsEmptyError);
        }

        if !s.starts_with("http") {
            return Ok(SpreadsheetId(s.to_owned()));
        }

        let id = SPREADSHEET_URL_ID
            .captures(s)
            .and_then(|captures| captures.get(1))
            .map_or(s, |id| id.as_str());

        Ok(SpreadsheetId(id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ms_duration() {
        assert_eq!(
            EnvMsDuration::from_str("2000"),
            Ok(EnvMsDuration(time::Duration::from_secs(2)))
        );
        assert_eq!(EnvMsDuration::from_str("2s"), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn non_empty_string() {
        assert_eq!(NonEmptyString::from_str("  "), Err(StringIsEmptyError));
        assert_eq!(
            NonEmptyString::from_str("token").unwrap().as_str(),
            "token"
        );
    }

    #[test]
    fn whitelist_from_env() {
        let whitelist = CampaignWhitelist::from_str(" Solar , ,Roofing,").unwrap();

        assert!(whitelist.admits("Solar"));
        assert!(whitelist.admits("Roofing"));
        assert!(!whitelist.admits("Insurance"));
        assert_eq!(whitelist.campaigns().collect::<Vec<_>>(), vec!["Roofing", "Solar"]);
    }

    #[test]
    fn empty_whitelist_admits_everything() {
        let whitelist = CampaignWhitelist::from_str("").unwrap();

        assert!(whitelist.is_empty());
        assert!(whitelist.admits("anything"));
        assert!(whitelist.admits(""));
    }

    #[test]
    fn spreadsheet_id_from_url() {
        let id = SpreadsheetId::from_str(
            "https://docs.google.com/spreadsheets/d/1AbC-d_9xYz/edit#gid=0",
        )
        .unwrap();
        assert_eq!(id.as_str(), "1AbC-d_9xYz");
    }

    #[test]
    fn spreadsheet_id_passthrough() {
        assert_eq!(SpreadsheetId::from_str("1AbC").unwrap().as_str(), "1AbC");
        assert_eq!(
            SpreadsheetId::from_str("https://example.com/sheet").unwrap().as_str(),
            "https://example.com/sheet"
        );
        assert!(SpreadsheetId::from_str("").is_err());
    }
}
