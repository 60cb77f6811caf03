// Token refresh logic
// Single-flighted refresh-token exchange against the refresh endpoint

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::credentials::CredentialStore;
use super::types::{Credential, RefreshRequest, RefreshResponse};
use crate::error::{transport_error_kind, RefreshError};

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

/// Process-wide refresh state; at most one exchange is ever in flight
enum RefreshState {
    Idle,
    InFlight { id: u64, future: SharedRefresh },
}

/// Performs the refresh-token exchange on behalf of all concurrent callers
///
/// Callers that ask while an exchange is running await the same shared
/// result. The exchange runs on its own task, so a caller giving up does not
/// cancel it for the others.
#[derive(Clone)]
pub struct CredentialRefresher {
    inner: Arc<RefresherInner>,
}

struct RefresherInner {
    client: Client,
    refresh_url: String,
    store: Arc<CredentialStore>,
    state: Mutex<RefreshState>,
    next_id: AtomicU64,
    exchanges: AtomicU64,
}

impl CredentialRefresher {
    pub fn new(client: Client, refresh_url: impl Into<String>, store: Arc<CredentialStore>) -> Self {
        Self {
            inner: Arc::new(RefresherInner {
                client,
                refresh_url: refresh_url.into(),
                store,
                state: Mutex::new(RefreshState::Idle),
                next_id: AtomicU64::new(0),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh credential, joining an in-flight exchange if there is one
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        self.join_or_start(None).await
    }

    /// Refresh after `failed_access_token` was rejected by the server
    ///
    /// If the stored access token has already moved on, another caller's
    /// refresh finished in the meantime and the stored credential is
    /// returned without a new exchange.
    pub async fn refresh_stale(&self, failed_access_token: &str) -> Result<Credential, RefreshError> {
        self.join_or_start(Some(failed_access_token)).await
    }

    /// Number of exchanges sent to the refresh endpoint so far
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    /// Whether an exchange is currently running
    pub async fn is_in_flight(&self) -> bool {
        matches!(*self.inner.state.lock().await, RefreshState::InFlight { .. })
    }

    async fn join_or_start(&self, failed_access_token: Option<&str>) -> Result<Credential, RefreshError> {
        let future = {
            let mut state = self.inner.state.lock().await;

            let in_flight = match &*state {
                RefreshState::InFlight { future, .. } => Some(future.clone()),
                RefreshState::Idle => None,
            };

            match in_flight {
                Some(future) => {
                    tracing::debug!("Joining in-flight token refresh");
                    future
                }
                None => {
                    if let Some(failed) = failed_access_token {
                        match self.inner.store.get().await? {
                            Some(current) if current.access_token != failed => {
                                tracing::debug!("Access token already refreshed, reusing it");
                                return Ok(current);
                            }
                            Some(_) => {}
                            None => {
                                return Err(RefreshError::Denied(
                                    "No credential available to refresh".to_string(),
                                ));
                            }
                        }
                    }

                    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                    let future = self.inner.clone().spawn_exchange(id);
                    *state = RefreshState::InFlight {
                        id,
                        future: future.clone(),
                    };
                    future
                }
            }
        };

        future.await
    }
}

impl RefresherInner {
    fn spawn_exchange(self: Arc<Self>, id: u64) -> SharedRefresh {
        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(self.exchange())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("Token refresh panicked");
                    Err(RefreshError::Unavailable("Token refresh panicked".to_string()))
                });
            // Reset on every outcome, or later callers keep joining a finished exchange
            self.finish(id).await;
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(RefreshError::Unavailable(format!("Refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Return to idle so a later 401 can trigger a new exchange
    async fn finish(&self, id: u64) {
        let mut state = self.state.lock().await;
        if matches!(*state, RefreshState::InFlight { id: current, .. } if current == id) {
            *state = RefreshState::Idle;
        }
    }

    async fn exchange(&self) -> Result<Credential, RefreshError> {
        let current = self.store.get().await?.ok_or_else(|| {
            RefreshError::Denied("No refresh token available".to_string())
        })?;

        tracing::info!(url = %self.refresh_url, "Refreshing access token...");
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh_token: &current.refresh_token,
            })
            .send()
            .await
            .map_err(|e| {
                let error_kind = transport_error_kind(&e);
                tracing::warn!(error_kind, error = %e, "Token refresh request failed");
                RefreshError::Unavailable(format!("{} (kind: {})", e, error_kind))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let err = RefreshError::from_status(status.as_u16(), &error_text);
            match &err {
                RefreshError::Denied(_) => tracing::error!(
                    status = status.as_u16(),
                    body = %error_text,
                    "Refresh token rejected"
                ),
                _ => tracing::warn!(
                    status = status.as_u16(),
                    body = %error_text,
                    "Refresh endpoint unavailable"
                ),
            }
            return Err(err);
        }

        let data: RefreshResponse = response.json().await.map_err(|e| {
            RefreshError::Unavailable(format!("Failed to parse refresh response: {}", e))
        })?;

        if data.access_token.is_empty() {
            return Err(RefreshError::Unavailable(
                "Refresh response does not contain accessToken".to_string(),
            ));
        }

        let refreshed = data.into_credential(&current.refresh_token);

        if !self
            .store
            .replace_if_current(&current.refresh_token, &refreshed)
            .await?
        {
            // Signed out or signed in again while the exchange was running
            return match self.store.get().await? {
                Some(now_stored) => Ok(now_stored),
                None => Err(RefreshError::Denied(
                    "Signed out while refreshing".to_string(),
                )),
            };
        }

        tracing::info!(
            expires_at = ?refreshed.expires_at.map(|t| t.to_rfc3339()),
            "Access token refreshed"
        );

        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::SessionState;
    use crate::auth::storage::MemoryStorage;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    async fn setup(url: &str) -> (CredentialRefresher, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(SessionState::new()),
        ));
        store
            .set(&Credential::new("old-access", "old-refresh", None))
            .await
            .unwrap();
        let refresher = CredentialRefresher::new(Client::new(), format!("{}/auth/refresh", url), store.clone());
        (refresher, store)
    }

    #[tokio::test]
    async fn test_refresh_success_updates_store() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .match_body(Matcher::Json(json!({ "refreshToken": "old-refresh" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accessToken":"new-access","refreshToken":"new-refresh"}"#)
            .expect(1)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;
        let cred = refresher.refresh().await.unwrap();

        assert_eq!(cred.access_token, "new-access");
        assert_eq!(cred.refresh_token, "new-refresh");
        assert_eq!(store.get().await.unwrap(), Some(cred));
        assert!(!refresher.is_in_flight().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_denied_on_401_and_403() {
        for status in [401, 403] {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/auth/refresh")
                .with_status(status)
                .create_async()
                .await;

            let (refresher, store) = setup(&server.url()).await;
            let err = refresher.refresh().await.unwrap_err();
            assert!(matches!(err, RefreshError::Denied(_)), "status {}", status);
            // The refresher leaves clearing to the escalation path
            assert!(store.get().await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_refresh_unavailable_on_5xx() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(503)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;
        let err = refresher.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Unavailable(_)));
        assert_eq!(store.get().await.unwrap().unwrap().access_token, "old-access");
    }

    #[tokio::test]
    async fn test_absurd_lifetime_does_not_wedge_refresher() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/auth/refresh")
            .match_body(Matcher::Json(json!({ "refreshToken": "old-refresh" })))
            .with_status(200)
            .with_body(r#"{"accessToken":"a2","refreshToken":"r2","expiresIn":10000000000000000}"#)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/auth/refresh")
            .match_body(Matcher::Json(json!({ "refreshToken": "r2" })))
            .with_status(200)
            .with_body(r#"{"accessToken":"a3","refreshToken":"r3","expiresIn":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;

        let cred = refresher.refresh().await.unwrap();
        assert_eq!(cred.access_token, "a2");
        assert!(cred.expires_at.is_some());
        assert!(!refresher.is_in_flight().await);

        let cred = refresher.refresh().await.unwrap();
        assert_eq!(cred.access_token, "a3");
        assert_eq!(store.get().await.unwrap().unwrap().refresh_token, "r3");
        assert_eq!(refresher.exchange_count(), 2);

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_unavailable_on_garbage_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let (refresher, _) = setup(&server.url()).await;
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_unavailable_on_connection_failure() {
        // Nothing listens on port 9 of localhost
        let (refresher, _) = setup("http://127.0.0.1:9").await;
        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_credential_is_denied() {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(SessionState::new()),
        ));
        let refresher = CredentialRefresher::new(Client::new(), "http://127.0.0.1:9/auth/refresh", store);

        assert!(matches!(
            refresher.refresh().await,
            Err(RefreshError::Denied(_))
        ));
        assert_eq!(refresher.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_stale_skips_exchange_when_already_rotated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;
        store
            .set(&Credential::new("newer-access", "newer-refresh", None))
            .await
            .unwrap();

        let cred = refresher.refresh_stale("old-access").await.unwrap();
        assert_eq!(cred.access_token, "newer-access");
        assert_eq!(refresher.exchange_count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"new-access"}"#)
            .expect(1)
            .create_async()
            .await;

        let (refresher, _) = setup(&server.url()).await;

        let results = futures::future::join_all(
            (0..8).map(|_| {
                let refresher = refresher.clone();
                async move { refresher.refresh_stale("old-access").await }
            }),
        )
        .await;

        for result in results {
            assert_eq!(result.unwrap().access_token, "new-access");
        }
        assert_eq!(refresher.exchange_count(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_refresh() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"new-access"}"#)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;

        // Start the exchange and give up immediately
        let first = tokio::time::timeout(Duration::from_millis(1), refresher.refresh()).await;
        drop(first);

        // A second caller either joins the same exchange or finds it done
        let cred = refresher.refresh_stale("old-access").await.unwrap();
        assert_eq!(cred.access_token, "new-access");
        assert_eq!(store.get().await.unwrap().unwrap().access_token, "new-access");
        assert_eq!(refresher.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_during_refresh_is_not_undone() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"new-access"}"#)
            .create_async()
            .await;

        let (refresher, store) = setup(&server.url()).await;
        let pending = tokio::spawn({
            let refresher = refresher.clone();
            async move { refresher.refresh().await }
        });
        store.clear().await.unwrap();

        // Depending on timing the exchange either saw no credential or lost
        // the swap; the store stays empty either way
        let _ = pending.await.unwrap();
        assert_eq!(store.get().await.unwrap(), None);
    }
}
