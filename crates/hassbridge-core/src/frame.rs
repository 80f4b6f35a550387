//! Event channel frames.
//!
//! The remote event channel speaks JSON objects tagged by `type`. Inbound
//! frames are decoded into [`Frame`]; anything with an unrecognised tag
//! becomes [`Frame::Unknown`] so callers can reject it explicitly.

use crate::Credential;
use serde::{Deserialize, Serialize};

/// Frames received from the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent on connect when the service wants credentials.
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    /// Credentials accepted.
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    /// Credentials rejected.
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    /// Response to a request carrying the same `id`.
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
    /// An event delivered for the subscription with this `id`.
    Event { id: u64, event: serde_json::Value },
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The `ha_version` announced by an auth frame, if any.
    pub fn ha_version(&self) -> Option<&str> {
        match self {
            Self::AuthRequired { ha_version } | Self::AuthOk { ha_version } => {
                ha_version.as_deref()
            }
            _ => None,
        }
    }

    /// Short name of the frame type, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthInvalid { .. } => "auth_invalid",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
            Self::Unknown => "unknown",
        }
    }
}

/// Frames sent to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Auth {
        #[serde(skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        api_password: Option<String>,
    },
    SubscribeEvents { id: u64 },
}

impl OutboundFrame {
    /// Build the auth frame for a credential. Exactly one field is set.
    pub fn auth(credential: &Credential) -> Self {
        match credential {
            Credential::Token(token) => Self::Auth {
                access_token: Some(token.clone()),
                api_password: None,
            },
            Credential::LegacyKey(key) => Self::Auth {
                access_token: None,
                api_password: Some(key.clone()),
            },
        }
    }

    pub fn subscribe(id: u64) -> Self {
        Self::SubscribeEvents { id }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> String {
        // Only strings and integers: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
