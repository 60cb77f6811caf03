//! Application-root container wiring the authentication components together.
//!
//! One [`AuthPipeline`] is created at start-up and handed to whatever needs
//! to make API calls or watch the session; nothing in the crate is global.

use futures::Stream;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{
    Credential, CredentialRefresher, CredentialStore, FailureEscalation, KeyringStorage,
    MemoryStorage, SecretStorage, Session, SessionState, SqliteStorage,
};
use crate::config::{Config, StorageBackend};
use crate::error::{ApiError, RefreshError};
use crate::http_client::{build_client, ApiResponse, RequestConfig, RequestExecutor};

pub struct AuthPipeline {
    session: Arc<SessionState>,
    store: Arc<CredentialStore>,
    refresher: CredentialRefresher,
    escalation: FailureEscalation,
    executor: RequestExecutor,
}

impl AuthPipeline {
    /// Wire the pipeline over `storage` without reading it yet
    pub fn new(config: &Config, storage: Arc<dyn SecretStorage>) -> Result<Self, ApiError> {
        let client = build_client(config.connect_timeout, config.request_timeout)?;

        let session = Arc::new(SessionState::new());
        let store = Arc::new(CredentialStore::new(storage, session.clone()));
        let refresher =
            CredentialRefresher::new(client.clone(), config.refresh_url(), store.clone());
        let escalation = FailureEscalation::new(store.clone());
        let executor = RequestExecutor::new(
            client,
            config.api_base_url.clone(),
            store.clone(),
            refresher.clone(),
            escalation.clone(),
            config.token_refresh_threshold,
        );

        Ok(Self {
            session,
            store,
            refresher,
            escalation,
            executor,
        })
    }

    /// Wire the pipeline and restore any previously stored session
    pub async fn open(config: &Config, storage: Arc<dyn SecretStorage>) -> Result<Self, ApiError> {
        let pipeline = Self::new(config, storage)?;
        pipeline.store.restore().await?;
        Ok(pipeline)
    }

    /// Open the pipeline over the storage backend named in `config`
    pub async fn from_config(config: &Config) -> Result<Self, ApiError> {
        let storage: Arc<dyn SecretStorage> = match config.storage_backend {
            StorageBackend::Keyring => Arc::new(KeyringStorage::new(&config.keyring_service)),
            StorageBackend::Sqlite => Arc::new(SqliteStorage::open(&config.auth_db_file)?),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };

        tracing::debug!(backend = ?config.storage_backend, "Opening secret storage");
        Self::open(config, storage).await
    }

    /// Store a credential issued by the sign-in flow
    pub async fn sign_in(&self, credential: Credential, identity: Option<&str>) -> Result<(), ApiError> {
        self.store.sign_in(&credential, identity).await?;
        tracing::info!(identity = identity.unwrap_or("-"), "Signed in");
        Ok(())
    }

    /// Forget the stored credential; returns whether one was present
    pub async fn sign_out(&self) -> Result<bool, ApiError> {
        let had_credential = self.store.clear().await?;
        tracing::info!(had_credential, "Signed out");
        Ok(had_credential)
    }

    pub fn session(&self) -> Session {
        self.session.current()
    }

    /// Stream of session transitions for the UI layer
    pub fn session_changes(&self) -> impl Stream<Item = Session> + Send + 'static {
        self.session.changes()
    }

    pub async fn credential(&self) -> Result<Option<Credential>, ApiError> {
        Ok(self.store.get().await?)
    }

    pub async fn execute(&self, config: RequestConfig) -> Result<ApiResponse, ApiError> {
        self.executor.execute(config).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.executor.get(path).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        self.executor.post_json(path, body).await
    }

    /// Refresh now, signing out if the refresh token is rejected
    pub async fn refresh(&self) -> Result<Credential, ApiError> {
        let exchanged = self.store.get().await?;

        match self.refresher.refresh().await {
            Ok(credential) => Ok(credential),
            Err(RefreshError::Denied(reason)) => {
                tracing::error!(reason = %reason, "Token refresh denied, signing out");
                if let Some(rejected) = exchanged {
                    self.escalation
                        .on_unrecoverable_auth_failure(&rejected.refresh_token)
                        .await?;
                }
                Err(ApiError::Unauthenticated)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn refresher(&self) -> &CredentialRefresher {
        &self.refresher
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }
}
