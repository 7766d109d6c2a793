use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::OpenSkyCredentials;
use crate::errors::{Result, auth_failure};

/// Tokens are renewed once they get this close to their expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: Instant,
}

impl CachedToken {
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.expires_at.saturating_duration_since(now) <= REFRESH_MARGIN
    }
}

/// OAuth2 client-credentials token source with a single cached bearer token.
pub struct TokenProvider {
    http: Client,
    token_url: String,
    credentials: OpenSkyCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: Client, token_url: &str, credentials: OpenSkyCredentials) -> Self {
        TokenProvider { http, token_url: token_url.to_string(), credentials, cached: Mutex::new(None) }
    }

    /// A token that stays valid for longer than [`REFRESH_MARGIN`], exchanging credentials if needed.
    pub async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.needs_refresh(Instant::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.request_token().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken> {
        info!("Requesting new OAuth2 token from {}", self.token_url);

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        let resp = self.http.post(&self.token_url).form(&params).send().await.map_err(|e| {
            error!("OAuth2 token request failed: {}", e);
            auth_failure(format!("token request failed: {e}"))
        })?;

        let status = resp.status();
        if !status.is_success() {
            error!("OAuth2 token endpoint returned {}", status);
            return Err(auth_failure(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse =
            resp.json().await.map_err(|e| auth_failure(format!("token response not understood: {e}")))?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        info!("OAuth2 token acquired, expires in {} seconds", expires_in);

        Ok(CachedToken { access_token: body.access_token, expires_at: expiry(Instant::now(), expires_in) })
    }
}

fn expiry(now: Instant, expires_in: u64) -> Instant {
    now.checked_add(Duration::from_secs(expires_in)).unwrap_or_else(|| {
        warn!("token lifetime of {} seconds is out of range, assuming {}", expires_in, DEFAULT_EXPIRES_IN);
        now + Duration::from_secs(DEFAULT_EXPIRES_IN)
    })
}
