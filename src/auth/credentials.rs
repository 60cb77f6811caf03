// Credential store backed by secret storage

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::session::SessionState;
use super::storage::SecretStorage;
use super::types::Credential;
use crate::error::StorageUnavailable;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const EXPIRES_AT_KEY: &str = "expiresAt";
pub const IDENTITY_KEY: &str = "userEmail";

/// Sole owner of the persisted credential pair
///
/// Every read and write goes through one async lock, so the access and
/// refresh tokens are never observed half-written. After each write the
/// session state is recomputed from what was stored.
pub struct CredentialStore {
    storage: Arc<dyn SecretStorage>,
    session: Arc<SessionState>,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SecretStorage>, session: Arc<SessionState>) -> Self {
        Self {
            storage,
            session,
            lock: Mutex::new(()),
        }
    }

    /// Current credential, if a complete pair is stored
    pub async fn get(&self) -> Result<Option<Credential>, StorageUnavailable> {
        let _guard = self.lock.lock().await;
        self.read_credential()
    }

    /// Replace the stored credential (last writer wins)
    pub async fn set(&self, credential: &Credential) -> Result<(), StorageUnavailable> {
        let _guard = self.lock.lock().await;

        self.write_locked(credential)?;

        tracing::debug!(credential = ?credential, "Stored credential");
        self.publish_locked()
    }

    /// Store `credential` only if the stored refresh token is still
    /// `expected_refresh_token`
    ///
    /// A refresh that raced with sign-out or a new sign-in must not resurrect
    /// or overwrite what is there now. Returns whether the swap happened.
    pub async fn replace_if_current(
        &self,
        expected_refresh_token: &str,
        credential: &Credential,
    ) -> Result<bool, StorageUnavailable> {
        let _guard = self.lock.lock().await;

        let current = self.storage.get_item(REFRESH_TOKEN_KEY)?;
        if current.as_deref() != Some(expected_refresh_token) {
            tracing::warn!("Stored credential changed during refresh, discarding refreshed token");
            return Ok(false);
        }

        self.write_locked(credential)?;

        tracing::debug!(credential = ?credential, "Stored refreshed credential");
        self.publish_locked()?;
        Ok(true)
    }

    /// Store a freshly issued credential together with who it belongs to
    ///
    /// Identity is written first so subscribers see a single transition.
    pub async fn sign_in(
        &self,
        credential: &Credential,
        identity: Option<&str>,
    ) -> Result<(), StorageUnavailable> {
        let _guard = self.lock.lock().await;

        match identity {
            Some(identity) => self.storage.set_item(IDENTITY_KEY, identity)?,
            None => self.storage.delete_item(IDENTITY_KEY)?,
        }
        self.write_locked(credential)?;

        tracing::debug!(credential = ?credential, identity = ?identity, "Signed in");
        self.publish_locked()
    }

    pub async fn identity(&self) -> Result<Option<String>, StorageUnavailable> {
        let _guard = self.lock.lock().await;
        self.storage.get_item(IDENTITY_KEY)
    }

    /// Remove the credential and identity
    ///
    /// Returns whether a credential was present before clearing.
    pub async fn clear(&self) -> Result<bool, StorageUnavailable> {
        let _guard = self.lock.lock().await;
        let had_credential = self.read_credential()?.is_some();

        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, IDENTITY_KEY] {
            self.storage.delete_item(key)?;
        }

        tracing::debug!(had_credential, "Cleared stored credential");
        self.publish_locked()?;
        Ok(had_credential)
    }

    /// Clear only if the stored refresh token is still `expected_refresh_token`
    ///
    /// Used when that token was rejected: a newer sign-in stored meanwhile
    /// stays. Returns whether anything was removed.
    pub async fn clear_if_current(
        &self,
        expected_refresh_token: &str,
    ) -> Result<bool, StorageUnavailable> {
        let _guard = self.lock.lock().await;

        let current = self.storage.get_item(REFRESH_TOKEN_KEY)?;
        if current.as_deref() != Some(expected_refresh_token) {
            tracing::debug!("Rejected refresh token is no longer stored, keeping credential");
            return Ok(false);
        }

        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, IDENTITY_KEY] {
            self.storage.delete_item(key)?;
        }

        tracing::debug!("Cleared rejected credential");
        self.publish_locked()?;
        Ok(true)
    }

    /// Publish the session implied by whatever is already in storage
    ///
    /// Called once at start-up to restore a previous sign-in.
    pub async fn restore(&self) -> Result<Option<Credential>, StorageUnavailable> {
        let _guard = self.lock.lock().await;
        let credential = self.read_credential()?;
        self.publish_locked()?;

        match &credential {
            Some(cred) => tracing::info!(credential = ?cred, "Restored stored credential"),
            None => tracing::info!("No stored credential to restore"),
        }

        Ok(credential)
    }

    fn read_credential(&self) -> Result<Option<Credential>, StorageUnavailable> {
        let access_token = self.storage.get_item(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.storage.get_item(REFRESH_TOKEN_KEY)?;

        let (Some(access_token), Some(refresh_token)) = (access_token, refresh_token) else {
            return Ok(None);
        };

        let expires_at = match self.storage.get_item(EXPIRES_AT_KEY)? {
            Some(raw) => match parse_datetime(&raw) {
                Some(dt) => Some(dt),
                None => {
                    tracing::warn!("Ignoring unparseable stored expiry: {}", raw);
                    None
                }
            },
            None => None,
        };

        Ok(Some(Credential {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    /// Write the pair with the access token last
    ///
    /// The access token is removed up front, so a write that fails part way
    /// leaves no credential rather than a new token next to an old one.
    fn write_locked(&self, credential: &Credential) -> Result<(), StorageUnavailable> {
        self.storage.delete_item(ACCESS_TOKEN_KEY)?;

        let written = self.write_pair(credential);
        if let Err(e) = &written {
            tracing::error!(error = %e, "Credential write interrupted, stored pair discarded");
            if let Err(e) = self.publish_locked() {
                tracing::warn!(error = %e, "Could not republish session after failed write");
            }
        }
        written
    }

    fn write_pair(&self, credential: &Credential) -> Result<(), StorageUnavailable> {
        self.storage.set_item(REFRESH_TOKEN_KEY, &credential.refresh_token)?;
        match credential.expires_at {
            Some(exp) => self.storage.set_item(EXPIRES_AT_KEY, &exp.to_rfc3339())?,
            None => self.storage.delete_item(EXPIRES_AT_KEY)?,
        }
        self.storage.set_item(ACCESS_TOKEN_KEY, &credential.access_token)
    }

    fn publish_locked(&self) -> Result<(), StorageUnavailable> {
        let has_credential = self.read_credential()?.is_some();
        let identity = self.storage.get_item(IDENTITY_KEY)?;
        self.session.recompute(has_credential, identity);
        Ok(())
    }
}

/// Parse datetime from RFC 3339 / ISO 8601 with `Z` or an explicit offset
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
