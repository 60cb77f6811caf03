// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds shaved off the server-reported lifetime so a token is replaced
/// before the server starts rejecting it
pub const EXPIRY_BUFFER_SECS: i64 = 60;

/// Lifetime assumed when the refresh response omits `expiresIn`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Longest token lifetime honoured, from the server or the command line
pub const MAX_EXPIRES_IN_SECS: u64 = 10 * 365 * 24 * 3600;

/// Point in time `secs` from now, capped at `MAX_EXPIRES_IN_SECS`
pub fn expires_after(secs: u64) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(secs.min(MAX_EXPIRES_IN_SECS) as i64)
}

/// Access/refresh credential pair
///
/// Replaced wholesale on refresh; holders only ever see a cloned snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Check if the access token expires within `threshold_secs` from now
    ///
    /// A credential without expiry information is never considered expiring;
    /// the server's 401 is the only signal for those.
    pub fn is_expiring_within(&self, threshold_secs: i64) -> bool {
        let Some(exp) = self.expires_at else {
            return false;
        };

        // A horizon past chrono's range covers every representable expiry
        match Duration::try_seconds(threshold_secs).and_then(|d| Utc::now().checked_add_signed(d)) {
            Some(horizon) => exp <= horizon,
            None => threshold_secs > 0,
        }
    }

    /// Check if the access token is already past its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| Utc::now() >= exp).unwrap_or(false)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Shorten a token for logs: first four characters, then its length
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}...({} chars)", prefix, token.chars().count())
}

/// Authenticated/unauthenticated view derived from the credential store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub is_authenticated: bool,
    pub identity: Option<String>,
}

impl Session {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn authenticated(identity: Option<String>) -> Self {
        Self {
            is_authenticated: true,
            identity,
        }
    }
}

/// Refresh endpoint request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh endpoint response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl RefreshResponse {
    /// Build the replacement credential, keeping the previous refresh token
    /// when the server does not rotate it
    pub fn into_credential(self, previous_refresh_token: &str) -> Credential {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = expires_after(expires_in) - Duration::seconds(EXPIRY_BUFFER_SECS);

        Credential {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| previous_refresh_token.to_string()),
            expires_at: Some(expires_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiring_within_threshold() {
        let cred = Credential::new("a", "r", Some(Utc::now() + Duration::seconds(600)));
        assert!(!cred.is_expiring_within(300));
        assert!(cred.is_expiring_within(900));
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_no_expiry_never_expiring() {
        let cred = Credential::new("a", "r", None);
        assert!(!cred.is_expiring_within(i64::MAX / 2));
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_expired() {
        let cred = Credential::new("a", "r", Some(Utc::now() - Duration::seconds(1)));
        assert!(cred.is_expired());
        assert!(cred.is_expiring_within(0));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let cred = Credential::new("secret-access-token", "secret-refresh-token", None);
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("secret-access-token"));
        assert!(!printed.contains("secret-refresh-token"));
        assert!(printed.contains("secr...(19 chars)"));
    }

    #[test]
    fn test_refresh_response_keeps_old_refresh_token() {
        let resp: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"new-access"}"#).unwrap();
        let cred = resp.into_credential("old-refresh");
        assert_eq!(cred.access_token, "new-access");
        assert_eq!(cred.refresh_token, "old-refresh");
        assert!(cred.expires_at.is_some());
    }

    #[test]
    fn test_refresh_response_rotates_refresh_token() {
        let resp: RefreshResponse = serde_json::from_str(
            r#"{"accessToken":"new-access","refreshToken":"new-refresh","expiresIn":120}"#,
        )
        .unwrap();
        let cred = resp.into_credential("old-refresh");
        assert_eq!(cred.refresh_token, "new-refresh");
        // 120s lifetime minus the 60s buffer
        assert!(cred.is_expiring_within(61));
        assert!(!cred.is_expiring_within(30));
    }

    #[test]
    fn test_huge_lifetime_is_capped() {
        let resp: RefreshResponse = serde_json::from_str(
            r#"{"accessToken":"new-access","expiresIn":10000000000000000}"#,
        )
        .unwrap();
        let cred = resp.into_credential("r");
        let cap = (MAX_EXPIRES_IN_SECS + 60) as i64;
        assert!(!cred.is_expiring_within(3600));
        assert!(cred.is_expiring_within(cap));

        let far = expires_after(u64::MAX);
        assert!(far <= Utc::now() + Duration::seconds(MAX_EXPIRES_IN_SECS as i64));
    }

    #[test]
    fn test_extreme_threshold_does_not_overflow() {
        let cred = Credential::new("a", "r", Some(Utc::now() + Duration::days(1)));
        assert!(cred.is_expiring_within(i64::MAX));
        assert!(!cred.is_expiring_within(i64::MIN));
    }

    #[test]
    fn test_refresh_request_wire_format() {
        let body = serde_json::to_value(RefreshRequest { refresh_token: "r1" }).unwrap();
        assert_eq!(body, serde_json::json!({ "refreshToken": "r1" }));
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = Session::authenticated(Some("a@b.c".to_string()));
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["isAuthenticated"], true);
        assert_eq!(value["identity"], "a@b.c");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn redact_never_reveals_whole_token(token in "[a-zA-Z0-9._-]{9,64}") {
                let redacted = redact(&token);
                prop_assert!(!redacted.contains(&token));
                let expected_suffix = format!("({} chars)", token.len());
                prop_assert!(redacted.ends_with(&expected_suffix));
            }
        }
    }
}
