//! The upstream identity provider.
//!
//! The broker is an OAuth 2.0 *client* of exactly one upstream provider.
//! [`UpstreamProvider`] is the seam: [`GoogleProvider`] talks to Google's
//! authorization, token and userinfo endpoints, and tests substitute a fake.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use calbridge_store::UpstreamToken;
use serde::Deserialize;
use url::Url;

use crate::error::{BrokerError, Result};

/// Ceiling on any single request to Google.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Scopes requested from Google: calendar, mail, and the email address used
/// as the subject.
pub const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Operations the broker needs from the upstream provider.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// URL to send the user to, carrying the broker's correlation `state`.
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// Exchange an upstream authorization code for a token.
    async fn exchange_code(&self, code: &str) -> Result<UpstreamToken>;

    /// The verified subject (email address) the token belongs to.
    async fn fetch_subject(&self, token: &UpstreamToken) -> Result<String>;

    /// Obtain a fresh access token with a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken>;
}

// ---------------------------------------------------------------------------
// Credentials file
// ---------------------------------------------------------------------------

/// OAuth client credentials as downloaded from the Google Cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The file nests the credentials under `web` or `installed` depending on
/// the client type chosen in the console.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    web: Option<GoogleCredentials>,
    installed: Option<GoogleCredentials>,
}

impl GoogleCredentials {
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_str(json)?;
        let credentials = file.web.or(file.installed).ok_or_else(|| BrokerError::InvalidConfig {
            reason: "credentials file has neither a \"web\" nor an \"installed\" section"
                .to_string(),
        })?;
        if credentials.client_id.is_empty() {
            return Err(BrokerError::InvalidConfig {
                reason: "credentials file has an empty client_id".to_string(),
            });
        }
        Ok(credentials)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| BrokerError::InvalidConfig {
            reason: format!(
                "unable to read credentials file {}: {e}; download it from the Google Cloud console",
                path.display()
            ),
        })?;
        Self::from_json(&json)
    }
}

// ---------------------------------------------------------------------------
// Google provider
// ---------------------------------------------------------------------------

/// Endpoint and client configuration for [`GoogleProvider`].
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    /// Where Google sends the user back: the broker's callback endpoint.
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Per-request timeout, covering connect, send and body.
    pub timeout: Duration,
}

impl GoogleConfig {
    pub fn new(credentials: GoogleCredentials, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            auth_url: credentials.auth_uri,
            token_url: credentials.token_uri,
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
            redirect_uri: redirect_uri.into(),
            scopes: GOOGLE_SCOPES.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

/// Raw token response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into an [`UpstreamToken`], computing `expires_at` from
    /// `expires_in`.
    fn into_token(self) -> UpstreamToken {
        let expires_at = self
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs);

        let scopes = self
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        UpstreamToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scopes,
        }
    }
}

/// Raw error response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
    verified_email: Option<bool>,
}

/// Google as the upstream identity provider.
pub struct GoogleProvider {
    config: GoogleConfig,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GoogleConfig {
        &self.config
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<UpstreamToken> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", self.config.client_id.as_str()));
        if let Some(ref secret) = self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        parse_token_response(response).await
    }
}

#[async_trait]
impl UpstreamProvider for GoogleProvider {
    fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_uri);
            params.append_pair("state", state);
            if !self.config.scopes.is_empty() {
                params.append_pair("scope", &self.config.scopes.join(" "));
            }
            // Offline access plus forced consent so every grant carries a
            // refresh token.
            params.append_pair("access_type", "offline");
            params.append_pair("prompt", "consent");
        }
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamToken> {
        tracing::debug!(token_url = %self.config.token_url, "exchanging upstream authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn fetch_subject(&self, token: &UpstreamToken) -> Result<String> {
        let response = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Upstream {
                reason: format!("userinfo endpoint returned HTTP {status}"),
            });
        }

        let info: UserInfo = response.json().await.map_err(transport)?;
        if info.verified_email == Some(false) {
            return Err(BrokerError::Upstream {
                reason: "upstream email address is not verified".to_string(),
            });
        }
        match info.email {
            Some(email) if !email.is_empty() => Ok(email),
            _ => Err(BrokerError::Upstream {
                reason: "no email in userinfo response".to_string(),
            }),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken> {
        tracing::debug!(token_url = %self.config.token_url, "refreshing upstream access token");
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// Parse the HTTP response from the token endpoint.
async fn parse_token_response(response: reqwest::Response) -> Result<UpstreamToken> {
    let status = response.status();

    if status.is_success() {
        let token_response: TokenResponse = response.json().await.map_err(transport)?;
        tracing::debug!("upstream token request successful");
        return Ok(token_response.into_token());
    }

    let body = response.text().await.unwrap_or_default();
    Err(rejection_from_body(status, &body))
}

/// A timed-out request is an upstream failure, not a caller error.
fn transport(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Upstream {
            reason: "request to upstream provider timed out".to_string(),
        }
    } else {
        BrokerError::Network(err)
    }
}

fn rejection_from_body(status: reqwest::StatusCode, body: &str) -> BrokerError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(error_response) => BrokerError::UpstreamRejected {
            reason: error_response
                .error_description
                .unwrap_or(error_response.error),
        },
        Err(_) => BrokerError::UpstreamRejected {
            reason: format!("HTTP {status}: {body}"),
        },
    }
}
