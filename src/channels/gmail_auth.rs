//! Gmail OAuth for an installed application.
//!
//! The token is persisted in the state store under `gmail.token`. When none
//! is stored, the consent URL is printed and the authorization code is read
//! from stdin. Expired access tokens are refreshed and re-persisted.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConfigError, FetchError};
use crate::store::traits::StateStore;

/// State key holding the serialized OAuth token.
pub const TOKEN_STATE_KEY: &str = "gmail.token";

const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Supplies a bearer token for Gmail API calls.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<SecretString, FetchError>;
}

// ── Credentials file ────────────────────────────────────────────────

/// OAuth client from a Google Cloud credentials JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<OAuthClient>,
    web: Option<OAuthClient>,
}

impl OAuthClient {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: CredentialsFile =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
                key: "GMAIL_CREDENTIALS_FILE".into(),
                message: e.to_string(),
            })?;
        file.installed
            .or(file.web)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "GMAIL_CREDENTIALS_FILE".into(),
                message: "expected an \"installed\" or \"web\" client".into(),
            })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or("urn:ietf:wg:oauth:2.0:oob")
    }

    /// URL the user opens to grant read-only Gmail access.
    pub fn consent_url(&self) -> Result<reqwest::Url, FetchError> {
        reqwest::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri()),
                ("response_type", "code"),
                ("scope", GMAIL_READONLY_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", "state"),
            ],
        )
        .map_err(|e| FetchError::Auth(format!("invalid auth_uri: {e}")))
    }
}

// ── Token ───────────────────────────────────────────────────────────

struct OAuthToken {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at - Duration::seconds(EXPIRY_MARGIN_SECS) <= now)
    }
}

/// Persisted shape of the token.
#[derive(Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl From<StoredToken> for OAuthToken {
    fn from(t: StoredToken) -> Self {
        Self {
            access_token: SecretString::from(t.access_token),
            refresh_token: t.refresh_token.map(SecretString::from),
            expires_at: t.expires_at,
        }
    }
}

impl From<&OAuthToken> for StoredToken {
    fn from(t: &OAuthToken) -> Self {
        Self {
            access_token: t.access_token.expose_secret().to_string(),
            refresh_token: t
                .refresh_token
                .as_ref()
                .map(|r| r.expose_secret().to_string()),
            expires_at: t.expires_at,
        }
    }
}

// ── Authorizer ──────────────────────────────────────────────────────

pub struct GmailAuth {
    http: reqwest::Client,
    client: OAuthClient,
    state: Arc<dyn StateStore>,
    token: Mutex<Option<OAuthToken>>,
}

impl GmailAuth {
    pub fn new(client: OAuthClient, state: Arc<dyn StateStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client,
            state,
            token: Mutex::new(None),
        }
    }

    /// Load the persisted token, running the interactive consent flow when
    /// there is none.
    pub async fn authorize(&self) -> Result<(), FetchError> {
        if self.load_persisted().await? {
            info!("Using stored Gmail token");
            return Ok(());
        }

        let url = self.client.consent_url()?;
        println!("Open this URL in your browser to authorize Gmail access:\n\n{url}\n");
        println!("Paste the authorization code:");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| FetchError::Auth(format!("failed to read authorization code: {e}")))?;

        let code = line.trim();
        if code.is_empty() {
            return Err(FetchError::Auth("no authorization code entered".into()));
        }
        self.exchange_code(code).await?;
        info!("Gmail authorization complete");
        Ok(())
    }

    /// Returns true if a persisted token was found.
    async fn load_persisted(&self) -> Result<bool, FetchError> {
        let Some(raw) = self.state.get_state(TOKEN_STATE_KEY).await? else {
            return Ok(false);
        };
        let stored: StoredToken = serde_json::from_str(&raw)
            .map_err(|e| FetchError::Auth(format!("stored Gmail token is unreadable: {e}")))?;
        *self.token.lock().await = Some(stored.into());
        Ok(true)
    }

    /// Trade an authorization code for a token and persist it.
    pub async fn exchange_code(&self, code: &str) -> Result<(), FetchError> {
        let response = self
            .request_token(&[
                ("code", code),
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("redirect_uri", self.client.redirect_uri()),
                ("grant_type", "authorization_code"),
            ])
            .await?;

        let token = OAuthToken {
            access_token: SecretString::from(response.access_token),
            refresh_token: response.refresh_token.map(SecretString::from),
            expires_at: expiry(response.expires_in),
        };
        self.persist(&token).await?;
        *self.token.lock().await = Some(token);
        Ok(())
    }

    async fn refresh(&self, token: &mut OAuthToken) -> Result<(), FetchError> {
        let Some(refresh_token) = token.refresh_token.as_ref() else {
            return Err(FetchError::Auth(
                "access token expired and no refresh token is stored".into(),
            ));
        };

        let response = self
            .request_token(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        token.access_token = SecretString::from(response.access_token);
        if let Some(r) = response.refresh_token {
            token.refresh_token = Some(SecretString::from(r));
        }
        token.expires_at = expiry(response.expires_in);
        self.persist(token).await?;
        debug!("Gmail access token refreshed");
        Ok(())
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, FetchError> {
        let resp = self
            .http
            .post(&self.client.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| FetchError::Auth(format!("invalid token response: {e}")))
    }

    async fn persist(&self, token: &OAuthToken) -> Result<(), FetchError> {
        let json = serde_json::to_string(&StoredToken::from(token))
            .map_err(|e| FetchError::Auth(format!("failed to serialize token: {e}")))?;
        self.state.set_state(TOKEN_STATE_KEY, &json).await?;
        Ok(())
    }
}

#[async_trait]
impl AccessTokenProvider for GmailAuth {
    async fn access_token(&self) -> Result<SecretString, FetchError> {
        let mut guard = self.token.lock().await;
        let Some(token) = guard.as_mut() else {
            return Err(FetchError::Auth("Gmail is not authorized".into()));
        };
        if token.is_expired(Utc::now()) {
            self.refresh(token).await?;
        }
        Ok(SecretString::from(token.access_token.expose_secret()))
    }
}

fn expiry(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|secs| Utc::now() + Duration::seconds(secs))
}
