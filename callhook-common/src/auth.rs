use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::StoreError;

pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Refresh a little early so a request never goes out with a token about to expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Supplies bearer tokens for the tabular store.
#[async_trait]
pub trait TokenSource {
    async fn token(&self) -> Result<String, StoreError>;
}

/// A pre-issued token, taken as is.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, StoreError> {
        Ok(self.0.clone())
    }
}

/// Pick the token source for a process. Service-account credentials take precedence
/// over a static bearer token; blank values count as absent.
pub fn token_source(
    credentials_json: Option<&str>,
    access_token: Option<&str>,
) -> Result<Arc<dyn TokenSource + Send + Sync>, StoreError> {
    let credentials_json = credentials_json.filter(|value| !value.trim().is_empty());
    let access_token = access_token.filter(|value| !value.trim().is_empty());

    match (credentials_json, access_token) {
        (Some(credentials), _) => Ok(Arc::new(ServiceAccountTokenSource::from_json(
            credentials,
        )?)),
        (None, Some(token)) => Ok(Arc::new(StaticToken(token.trim().to_owned()))),
        (None, None) => Err(StoreError::AuthError(
            "no store credentials configured".to_owned(),
        )),
    }
}

/// The fields we need from a service-account credentials file.
#[derive(Deserialize, Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Exchanges a signed JWT assertion for an access token, caching it until shortly before
/// it expires.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
    /// Build from the JSON credentials document.
    pub fn from_json(credentials: &str) -> Result<Self, StoreError> {
        let key: ServiceAccountKey = serde_json::from_str(credentials)
            .map_err(|e| StoreError::AuthError(format!("invalid credentials json: {e}")))?;

        Self::new(key)
    }

    pub fn new(key: ServiceAccountKey) -> Result<Self, StoreError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::AuthError(format!("invalid private key: {e}")))?;

        Ok(Self {
            key,
            encoding_key,
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self) -> Result<String, StoreError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SPREADSHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| StoreError::AuthError(format!("failed to sign assertion: {e}")))
    }

    async fn exchange(&self) -> Result<CachedToken, StoreError> {
        let assertion = self.assertion()?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::AuthError(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "obtained access token");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn token(&self) -> Result<String, StoreError> {
        let mut cached = self.cached.lock().await;

        if let Some(current) = cached.as_ref() {
            if current.expires_at > Instant::now() {
                return Ok(current.token.clone());
            }
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const TEST_KEY: &str = include_str!("../tests/fixtures/service_account_key.pem");

    fn credentials(token_uri: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "client_email": "callhook@example.iam.gserviceaccount.com",
            "private_key": TEST_KEY,
            "token_uri": token_uri,
        })
        .to_string()
    }

    #[tokio::test]
    async fn static_token() {
        let source = StaticToken("abc".to_owned());
        assert_eq!(source.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn exchanges_and_caches_token() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "ya29.token", "expires_in": 3600, "token_type": "Bearer"}));
        });

        let source = ServiceAccountTokenSource::from_json(&credentials(&server.url("/token"))).unwrap();

        assert_eq!(source.token().await.unwrap(), "ya29.token");
        assert_eq!(source.token().await.unwrap(), "ya29.token");
        exchange.assert_hits(1);
    }

    #[tokio::test]
    async fn short_lived_tokens_are_refreshed() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "short", "expires_in": 30}));
        });

        let source = ServiceAccountTokenSource::from_json(&credentials(&server.url("/token"))).unwrap();

        source.token().await.unwrap();
        source.token().await.unwrap();
        exchange.assert_hits(2);
    }

    #[tokio::test]
    async fn rejected_exchange_is_an_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).body(r#"{"error":"invalid_grant"}"#);
        });

        let source = ServiceAccountTokenSource::from_json(&credentials(&server.url("/token"))).unwrap();

        assert!(matches!(source.token().await, Err(StoreError::AuthError(_))));
    }

    #[tokio::test]
    async fn token_source_prefers_credentials() {
        assert!(token_source(None, None).is_err());
        assert!(token_source(Some(" "), Some("")).is_err());

        let fallback = token_source(Some(""), Some(" abc ")).unwrap();
        assert_eq!(fallback.token().await.unwrap(), "abc");

        assert!(token_source(Some("{}"), Some("abc")).is_err());
    }

    #[test]
    fn bad_credentials_are_rejected_early() {
        assert!(ServiceAccountTokenSource::from_json("{}").is_err());
        assert!(ServiceAccountTokenSource::from_json(
            r#"{"client_email":"a","private_key":"not a key","token_uri":"http://x"}"#
        )
        .is_err());
    }
}
