//! OAuth2 client-credentials token manager for outbound calls.
//!
//! The policy and cache services may sit behind an OAuth2-protected gateway.
//! When client credentials are configured, this manager fetches an access
//! token from the token endpoint, caches it, and refreshes it shortly before
//! expiry. Callers ask for the current token on every request; a `None`
//! means unauthenticated operation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct AccessTokenManager {
    http_client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl AccessTokenManager {
    pub fn new(
        http_client: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http_client,
            token_url,
            client_id,
            client_secret,
            token: RwLock::new(None),
        }
    }

    /// Fetch an initial token, failing fast when the endpoint is
    /// unreachable or the credentials are rejected.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.refresh().await?;
        Ok(())
    }

    /// The current access token, refreshing when absent or near expiry.
    /// Returns `None` when a refresh fails; callers proceed without a
    /// bearer header and the upstream rejects the call if it cares.
    pub async fn access_token(&self) -> Option<String> {
        {
            let token = self.token.read().await;
            if let Some(cached) = token.as_ref() {
                if cached.expires_at > Utc::now() {
                    return Some(cached.access_token.clone());
                }
            }
        }

        match self.refresh().await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = ?e, "Access token refresh failed");
                None
            }
        }
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        let response = self
            .http_client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("token endpoint returned {}", status);
        }

        let parsed: TokenResponse = response.json().await?;
        let expires_at = Utc::now()
            + ChronoDuration::seconds((parsed.expires_in - EXPIRY_MARGIN_SECS).max(0));

        debug!(expires_in = parsed.expires_in, "Access token refreshed");

        let mut token = self.token.write().await;
        *token = Some(CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at,
        });

        Ok(parsed.access_token)
    }
}
