// Sign-out on unrecoverable authentication failure

use std::sync::Arc;

use super::credentials::CredentialStore;
use crate::error::StorageUnavailable;

/// Clears credentials when the refresh token is no longer accepted
///
/// Clearing the store is what moves the session to unauthenticated, which in
/// turn tells subscribers to route the user back to sign-in.
#[derive(Clone)]
pub struct FailureEscalation {
    store: Arc<CredentialStore>,
}

impl FailureEscalation {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    /// Sign out because `rejected_refresh_token` was refused
    ///
    /// Only clears when that token is still the stored one; a credential from
    /// a sign-in that happened while the refresh was failing is kept. A no-op
    /// when nothing is stored. Returns whether a credential was removed.
    pub async fn on_unrecoverable_auth_failure(
        &self,
        rejected_refresh_token: &str,
    ) -> Result<bool, StorageUnavailable> {
        let cleared = self.store.clear_if_current(rejected_refresh_token).await?;
        if cleared {
            tracing::warn!("Unrecoverable authentication failure, signed out");
        } else {
            tracing::debug!("Rejected credential already replaced, nothing to escalate");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::SessionState;
    use crate::auth::storage::MemoryStorage;
    use crate::auth::types::{Credential, Session};

    #[tokio::test]
    async fn test_escalation_clears_and_is_idempotent() {
        let session = Arc::new(SessionState::new());
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            session.clone(),
        ));
        store
            .sign_in(&Credential::new("a", "r", None), Some("user@example.com"))
            .await
            .unwrap();
        assert!(session.current().is_authenticated);

        let escalation = FailureEscalation::new(store.clone());
        assert!(escalation.on_unrecoverable_auth_failure("r").await.unwrap());
        assert_eq!(store.get().await.unwrap(), None);
        assert_eq!(store.identity().await.unwrap(), None);
        assert!(!session.current().is_authenticated);

        assert!(!escalation.on_unrecoverable_auth_failure("r").await.unwrap());
        assert!(!session.current().is_authenticated);
    }

    #[tokio::test]
    async fn test_escalation_surfaces_storage_failure() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(CredentialStore::new(
            storage.clone(),
            Arc::new(SessionState::new()),
        ));
        store.set(&Credential::new("a", "r", None)).await.unwrap();

        storage.set_unavailable(true);
        let escalation = FailureEscalation::new(store);
        assert!(escalation.on_unrecoverable_auth_failure("r").await.is_err());
    }

    #[tokio::test]
    async fn test_escalation_spares_newer_sign_in() {
        let session = Arc::new(SessionState::new());
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            session.clone(),
        ));
        store
            .sign_in(&Credential::new("new-a", "new-r", None), Some("new@example.com"))
            .await
            .unwrap();

        let escalation = FailureEscalation::new(store.clone());
        assert!(!escalation.on_unrecoverable_auth_failure("old-r").await.unwrap());
        assert_eq!(store.get().await.unwrap().unwrap().access_token, "new-a");
        assert_eq!(
            session.current(),
            Session::authenticated(Some("new@example.com".to_string()))
        );
    }
}
