//! JWT bearer authentication for the `/v1` routes.
//!
//! Keys are fetched from a JWKS endpoint and refreshed on an interval by a
//! background task; tokens are validated as RS256 against any of the
//! current keys. Authentication applies only when enabled in configuration.

use crate::errors::AuthError;
use crate::http::context::AppContext;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Holds the current JWKS key set and validates bearer tokens against it.
pub struct JwksVerifier {
    jwk_url: String,
    http_client: reqwest::Client,
    keys: RwLock<Vec<DecodingKey>>,
}

impl JwksVerifier {
    pub fn new(jwk_url: String, http_client: reqwest::Client) -> Self {
        Self {
            jwk_url,
            http_client,
            keys: RwLock::new(Vec::new()),
        }
    }

    /// Fetch the JWKS document and replace the key set.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let response = self
            .http_client
            .get(&self.jwk_url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchFailed {
                details: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::JwksFetchFailed {
                details: format!("JWKS endpoint returned {}", status),
            });
        }

        let document: JwksDocument =
            response.json().await.map_err(|e| AuthError::JwksFetchFailed {
                details: e.to_string(),
            })?;

        let mut keys = Vec::new();
        for jwk in &document.keys {
            if jwk.kty != "RSA" || jwk.n.is_empty() || jwk.e.is_empty() {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(error = %e, "Skipping unusable JWKS key"),
            }
        }

        if keys.is_empty() {
            return Err(AuthError::NoUsableKeys);
        }

        debug!(key_count = keys.len(), "JWKS key set refreshed");
        *self.keys.write().await = keys;
        Ok(())
    }

    /// Validate a bearer token against the current key set.
    pub async fn verify(&self, token: &str) -> Result<(), AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        let keys = self.keys.read().await;
        if keys.is_empty() {
            return Err(AuthError::NoUsableKeys);
        }

        let mut last_error = None;
        for key in keys.iter() {
            match decode::<serde_json::Value>(token, key, &validation) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(AuthError::TokenValidationFailed {
            details: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no keys tried".to_string()),
        })
    }

    /// Refresh the key set on an interval until cancelled.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        info!(jwk_url = %self.jwk_url, interval_secs = interval.as_secs(), "JWKS refresh task started");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "JWKS refresh failed, keeping previous key set");
                    }
                }
            }
        }
        info!("JWKS refresh task stopped");
    }
}

fn bearer_token(request: &Request) -> Result<&str, AuthError> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingBearerToken)
}

/// Middleware guarding the API routes. A pass-through when authentication
/// is not configured.
pub async fn require_auth(
    State(context): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, crate::http::errors::ApiError> {
    if let Some(verifier) = &context.verifier {
        let token = bearer_token(&request)?;
        verifier.verify(token).await?;
    }
    Ok(next.run(request).await)
}
