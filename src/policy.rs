//! Client for the external policy engine.
//!
//! A policy is addressed by a string path uniquely identifying it, e.g.
//! `policies/example/didResolve/1.0`. Evaluation is a POST of opaque JSON to
//! `{addr}/policy/{path}/evaluation`; a 200 response body is the evaluation
//! result, anything else is an error.

use crate::errors::PolicyError;
use crate::oauth::AccessTokenManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Remote evaluation of a named policy with opaque JSON input and output.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, policy: &str, data: &[u8]) -> Result<Vec<u8>, PolicyError>;
}

#[async_trait]
impl<T: PolicyEvaluator + ?Sized> PolicyEvaluator for Arc<T> {
    async fn evaluate(&self, policy: &str, data: &[u8]) -> Result<Vec<u8>, PolicyError> {
        self.as_ref().evaluate(policy, data).await
    }
}

/// HTTP client for the policy engine.
pub struct PolicyClient {
    addr: String,
    http_client: reqwest::Client,
    token_manager: Option<Arc<AccessTokenManager>>,
}

impl PolicyClient {
    pub fn new(
        addr: String,
        http_client: reqwest::Client,
        token_manager: Option<Arc<AccessTokenManager>>,
    ) -> Self {
        Self {
            addr,
            http_client,
            token_manager,
        }
    }
}

#[async_trait]
impl PolicyEvaluator for PolicyClient {
    async fn evaluate(&self, policy: &str, data: &[u8]) -> Result<Vec<u8>, PolicyError> {
        let uri = format!("{}/policy/{}/evaluation", self.addr, policy);
        let url = reqwest::Url::parse(&uri).map_err(|_| PolicyError::InvalidUrl { url: uri })?;

        let mut request = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec());

        if let Some(manager) = &self.token_manager {
            if let Some(token) = manager.access_token().await {
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await.map_err(|e| PolicyError::RequestFailed {
            policy: policy.to_string(),
            source: e,
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PolicyError::UnexpectedStatus {
                policy: policy.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PolicyError::RequestFailed {
                policy: policy.to_string(),
                source: e,
            })?;

        debug!(policy = %policy, response_len = body.len(), "Policy evaluated");
        Ok(body.to_vec())
    }
}
