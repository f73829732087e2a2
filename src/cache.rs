//! Client for the external cache service.
//!
//! Results are opaque blobs addressed by a `(key, namespace, scope)` triple
//! carried in `x-cache-*` headers. The key is the task or task-list id.

use crate::errors::CacheError;
use crate::oauth::AccessTokenManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const CACHE_KEY_HEADER: &str = "x-cache-key";
const CACHE_NAMESPACE_HEADER: &str = "x-cache-namespace";
const CACHE_SCOPE_HEADER: &str = "x-cache-scope";

/// Key/namespace/scope-addressed blob store for execution results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: &[u8],
    ) -> Result<(), CacheError>;

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, CacheError>;
}

#[async_trait]
impl<T: ResultCache + ?Sized> ResultCache for Arc<T> {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        self.as_ref().set(key, namespace, scope, value).await
    }

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, CacheError> {
        self.as_ref().get(key, namespace, scope).await
    }
}

/// HTTP client for the cache service.
pub struct CacheClient {
    addr: String,
    http_client: reqwest::Client,
    token_manager: Option<Arc<AccessTokenManager>>,
}

impl CacheClient {
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

    async fn bearer(&self) -> Option<String> {
        match &self.token_manager {
            Some(manager) => manager.access_token().await,
            None => None,
        }
    }
}

#[async_trait]
impl ResultCache for CacheClient {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        let mut request = self
            .http_client
            .post(format!("{}/v1/cache", self.addr))
            .header(CACHE_KEY_HEADER, key)
            .header(CACHE_NAMESPACE_HEADER, namespace)
            .header(CACHE_SCOPE_HEADER, scope)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(value.to_vec());

        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| CacheError::RequestFailed {
            operation: "set",
            source: e,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::UnexpectedStatus {
                operation: "set",
                status: status.as_u16(),
            });
        }

        debug!(key = %key, value_len = value.len(), "Stored value in cache");
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, CacheError> {
        let mut request = self
            .http_client
            .get(format!("{}/v1/cache", self.addr))
            .header(CACHE_KEY_HEADER, key)
            .header(CACHE_NAMESPACE_HEADER, namespace)
            .header(CACHE_SCOPE_HEADER, scope);

        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| CacheError::RequestFailed {
            operation: "get",
            source: e,
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CacheError::NotFound {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(CacheError::UnexpectedStatus {
                operation: "get",
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| CacheError::RequestFailed {
            operation: "get",
            source: e,
        })?;
        Ok(body.to_vec())
    }
}
