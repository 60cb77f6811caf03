use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::auth::{Credential, CredentialRefresher, CredentialStore, FailureEscalation};
use crate::error::{transport_error_kind, ApiError, RefreshError};

/// Build the shared HTTP client: JSON default headers and a fixed per-call timeout
pub fn build_client(connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// Immutable description of one API call
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,
    /// Path relative to the API base URL, or an absolute http(s) URL
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Fail with `Unauthenticated` instead of sending when signed out
    pub requires_auth: bool,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            requires_auth: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post_json<T: Serialize + ?Sized>(
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, ApiError> {
        let body = serde_json::to_vec(body).context("Failed to serialize request body")?;
        Ok(Self::new(Method::POST, path).with_body(body))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Allow sending without a credential (e.g. public endpoints)
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }
}

/// A request together with how many times it has been retried
#[derive(Debug, Clone)]
pub struct PendingRequest {
    config: Arc<RequestConfig>,
    attempt_count: u32,
}

impl PendingRequest {
    /// A request is resent at most once after an authentication failure
    pub const MAX_RETRIES: u32 = 1;

    pub fn new(config: RequestConfig) -> Self {
        Self {
            config: Arc::new(config),
            attempt_count: 0,
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn can_retry(&self) -> bool {
        self.attempt_count < Self::MAX_RETRIES
    }

    /// The same request, one retry further along
    pub fn retried(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            attempt_count: self.attempt_count + 1,
        }
    }
}

/// Fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .context("Failed to parse response body")
            .map_err(ApiError::from)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends API requests with the current credential attached
///
/// Handles:
/// - credential close to expiry: refreshes before sending
/// - 401: refreshes (single-flighted) and resends exactly once
/// - refresh denied: signs out and fails with `Unauthenticated`
/// - refresh unavailable: fails with a retryable `RequestFailed`
///
/// Every other status is handed back to the caller unchanged.
pub struct RequestExecutor {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: String,

    store: Arc<CredentialStore>,

    refresher: CredentialRefresher,

    escalation: FailureEscalation,

    /// Refresh ahead of sending when the token expires within this many seconds
    refresh_threshold: i64,
}

impl RequestExecutor {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        store: Arc<CredentialStore>,
        refresher: CredentialRefresher,
        escalation: FailureEscalation,
        refresh_threshold: u64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            store,
            refresher,
            escalation,
            refresh_threshold: i64::try_from(refresh_threshold).unwrap_or(i64::MAX),
        }
    }

    /// Execute a request, attaching credentials and recovering from one 401
    pub async fn execute(&self, config: RequestConfig) -> Result<ApiResponse, ApiError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let span = tracing::debug_span!(
            "request",
            request_id = %request_id,
            method = %config.method,
            path = %config.path
        );

        self.execute_pending(PendingRequest::new(config))
            .instrument(span)
            .await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(RequestConfig::get(path)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(RequestConfig::post_json(path, body)?).await
    }

    async fn execute_pending(&self, mut pending: PendingRequest) -> Result<ApiResponse, ApiError> {
        let mut credential = self.store.get().await?;

        if credential.is_none() && pending.config().requires_auth {
            tracing::debug!("No stored credential for authenticated request");
            return Err(ApiError::Unauthenticated);
        }

        if let Some(current) = credential.take() {
            credential = Some(self.ensure_fresh(current).await?);
        }

        loop {
            tracing::debug!(
                attempt = pending.attempt_count() + 1,
                authenticated = credential.is_some(),
                "Executing request attempt"
            );

            let token = credential.as_ref().map(|c| c.access_token.as_str());
            let response = self.send(&pending, token).await?;

            if response.status != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            // Without an attached credential a 401 says nothing about token freshness
            let Some(failed) = credential.take() else {
                return Ok(response);
            };

            if !pending.can_retry() {
                tracing::warn!(
                    attempts = pending.attempt_count() + 1,
                    "Still unauthorized after refresh, giving up"
                );
                return Ok(response);
            }

            tracing::warn!("Received 401, refreshing token and retrying...");

            let refreshed = match self.refresher.refresh_stale(&failed.access_token).await {
                Ok(refreshed) => refreshed,
                Err(e) => return Err(self.handle_refresh_failure(e, &failed).await),
            };

            credential = Some(refreshed);
            pending = pending.retried();
        }
    }

    /// Refresh ahead of time when the credential is about to expire
    ///
    /// If the refresh endpoint is unreachable but the token has not actually
    /// expired yet, the existing token is used.
    async fn ensure_fresh(&self, credential: Credential) -> Result<Credential, ApiError> {
        if !credential.is_expiring_within(self.refresh_threshold) {
            return Ok(credential);
        }

        tracing::debug!("Access token expiring soon, refreshing before sending");

        match self.refresher.refresh_stale(&credential.access_token).await {
            Ok(refreshed) => Ok(refreshed),
            Err(RefreshError::Unavailable(msg)) if !credential.is_expired() => {
                tracing::warn!(
                    error = %msg,
                    "Using existing token despite refresh failure (not yet expired)"
                );
                Ok(credential)
            }
            Err(e) => Err(self.handle_refresh_failure(e, &credential).await),
        }
    }

    /// Map a failed refresh of `rejected` to the caller's error, signing out
    /// when its refresh token was denied
    async fn handle_refresh_failure(&self, err: RefreshError, rejected: &Credential) -> ApiError {
        match err {
            RefreshError::Denied(reason) => {
                tracing::error!(reason = %reason, "Token refresh denied, signing out");
                match self
                    .escalation
                    .on_unrecoverable_auth_failure(&rejected.refresh_token)
                    .await
                {
                    Ok(_) => ApiError::Unauthenticated,
                    Err(storage_err) => ApiError::StorageUnavailable(storage_err),
                }
            }
            other => {
                tracing::error!(error = %other, "Token refresh failed");
                other.into()
            }
        }
    }

    async fn send(
        &self,
        pending: &PendingRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let config = pending.config();
        let url = self.resolve_url(&config.path);

        let mut headers = config.headers.clone();
        headers.remove(AUTHORIZATION);
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Access token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(config.method.clone(), url.as_str())
            .headers(headers);
        if let Some(body) = &config.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(
                error_kind = transport_error_kind(&e),
                error = %e,
                url = %url,
                attempt = pending.attempt_count() + 1,
                "HTTP request error"
            );
            ApiError::from_transport(&e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            tracing::warn!(error = %e, url = %url, "Failed to read response body");
            ApiError::from_transport(&e)
        })?;

        tracing::debug!(status = %status, "Received HTTP response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn resolve_url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }
}

/// Join a request path onto the base URL; absolute URLs pass through
fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://api.example.com", "/inbox"),
            "https://api.example.com/inbox"
        );
        assert_eq!(
            resolve_url("https://api.example.com/v1/", "inbox"),
            "https://api.example.com/v1/inbox"
        );
        assert_eq!(
            resolve_url("https://api.example.com", "https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_pending_request_retry_budget() {
        let pending = PendingRequest::new(RequestConfig::get("/inbox"));
        assert_eq!(pending.attempt_count(), 0);
        assert!(pending.can_retry());

        let retried = pending.retried();
        assert_eq!(retried.attempt_count(), 1);
        assert!(!retried.can_retry());
        // Retrying leaves the first attempt as it was
        assert_eq!(pending.attempt_count(), 0);
        assert_eq!(retried.config().path, "/inbox");
    }

    #[test]
    fn test_request_config_builders() {
        let config = RequestConfig::post_json("/messages", &serde_json::json!({"to": "a@b.c"}))
            .unwrap()
            .with_header(
                HeaderName::from_static("x-trace"),
                HeaderValue::from_static("1"),
            )
            .public();

        assert_eq!(config.method, Method::POST);
        assert!(!config.requires_auth);
        assert_eq!(config.headers.get("x-trace").unwrap(), "1");
        let body: serde_json::Value = serde_json::from_slice(config.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["to"], "a@b.c");

        assert!(RequestConfig::get("/inbox").requires_auth);
    }

    #[test]
    fn test_api_response_helpers() {
        let response = ApiResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"count":3}"#),
        };
        assert!(response.is_success());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["count"], 3);
        assert_eq!(response.text(), r#"{"count":3}"#);

        let bad = ApiResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"<html>"),
        };
        assert!(bad.json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(10, 30).is_ok());
    }
}
