// Error handling module
// Defines the error taxonomy shared by the storage, refresh and request layers

use thiserror::Error;

/// The platform secret store could not be read or written
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Secret storage unavailable: {0}")]
pub struct StorageUnavailable(pub String);

impl StorageUnavailable {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<rusqlite::Error> for StorageUnavailable {
    fn from(err: rusqlite::Error) -> Self {
        Self(format!("sqlite: {}", err))
    }
}

impl From<keyring::Error> for StorageUnavailable {
    fn from(err: keyring::Error) -> Self {
        Self(format!("keyring: {}", err))
    }
}

/// Outcome of a failed refresh-token exchange
///
/// Cloneable because every waiter on a shared refresh receives its own copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Refresh token rejected; only a new sign-in can recover
    #[error("Refresh denied: {0}")]
    Denied(String),

    /// Network or server trouble; the credential is still usable later
    #[error("Refresh unavailable: {0}")]
    Unavailable(String),

    /// The refreshed credential could not be persisted
    #[error(transparent)]
    Storage(#[from] StorageUnavailable),
}

impl RefreshError {
    /// Classify a non-success status from the refresh endpoint
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 | 500..=599 => RefreshError::Unavailable(format!("{} - {}", status, body)),
            _ => RefreshError::Denied(format!("{} - {}", status, body)),
        }
    }
}

/// API errors returned by the request pipeline
#[derive(Error, Debug)]
pub enum ApiError {
    /// Secret storage failed while reading or writing credentials
    #[error(transparent)]
    StorageUnavailable(#[from] StorageUnavailable),

    /// No usable credential; the user has to sign in again
    #[error("Not authenticated")]
    Unauthenticated,

    /// Transport or transient failure, not retried by the pipeline
    #[error("Request failed: {message}")]
    RequestFailed { message: String, retryable: bool },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Whether the caller may try the same request again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RequestFailed { retryable: true, .. })
    }

    /// Categorize a reqwest transport error the way the logs report it
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let error_kind = transport_error_kind(err);
        ApiError::RequestFailed {
            message: format!("{} (kind: {})", err, error_kind),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Denied(_) => ApiError::Unauthenticated,
            RefreshError::Unavailable(msg) => ApiError::RequestFailed {
                message: format!("Token refresh unavailable: {}", msg),
                retryable: true,
            },
            RefreshError::Storage(e) => ApiError::StorageUnavailable(e),
        }
    }
}

/// Short label for a reqwest error, used as a structured log field
pub fn transport_error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else if err.is_request() {
        "request_error"
    } else if err.is_body() {
        "body_error"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ApiError>;
