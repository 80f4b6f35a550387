//! Credentials for the remote service.

use std::fmt;

/// The credential used to authenticate, on the event channel and over HTTP.
///
/// A long-lived access token takes precedence over the legacy API password.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived access token, sent as a bearer token.
    Token(String),
    /// Legacy API password (`ha_key`).
    LegacyKey(String),
}

impl Credential {
    /// Pick a credential by precedence: token, then legacy key, then none.
    pub fn select(token: Option<&str>, legacy_key: Option<&str>) -> Option<Self> {
        match (token, legacy_key) {
            (Some(token), _) => Some(Self::Token(token.to_string())),
            (None, Some(key)) => Some(Self::LegacyKey(key.to_string())),
            (None, None) => None,
        }
    }

    /// HTTP header name and value carrying this credential.
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Self::Token(token) => ("Authorization", format!("Bearer {token}")),
            Self::LegacyKey(key) => ("x-ha-access", key.clone()),
        }
    }
}

// Never print the secret itself.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(..)"),
            Self::LegacyKey(_) => f.write_str("LegacyKey(..)"),
        }
    }
}
