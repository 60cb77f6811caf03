// Authentication module
// Credential storage, refresh, session state and sign-out escalation

mod credentials;
mod escalation;
mod refresh;
mod session;
mod storage;
mod types;

pub use credentials::{
    CredentialStore, ACCESS_TOKEN_KEY, EXPIRES_AT_KEY, IDENTITY_KEY, REFRESH_TOKEN_KEY,
};
pub use escalation::FailureEscalation;
pub use refresh::CredentialRefresher;
pub use session::SessionState;
pub use storage::{KeyringStorage, MemoryStorage, SecretStorage, SqliteStorage};
pub use types::{expires_after, redact, Credential, Session};
