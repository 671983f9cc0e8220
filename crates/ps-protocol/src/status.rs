//! Pairing and connection status payloads
//!
//! The backend reports pairing progress in three places:
//!
//! - `GET /api/connection-status` returns a [`StatusUpdate`] directly
//! - `GET /api/qrcode` returns a [`PairingCodeResponse`]
//! - the status push channel sends [`StatusFrame`]s whose `data` field holds a
//!   JSON-encoded [`StatusUpdate`] (a string containing JSON, as relayed from
//!   the bridge), or nothing at all
//!
//! The pairing code travels as `qr_code` on the wire. `code_payload` is
//! accepted as an alias.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Pairing/connection status as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Raw status tag (`qr_ready`, `connected`, `error`, ...)
    pub status: String,
    /// Image-encoded pairing code, present only while awaiting pairing
    #[serde(
        default,
        rename = "qr_code",
        alias = "code_payload",
        skip_serializing_if = "Option::is_none"
    )]
    pub code_payload: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Backend timestamp of the status
    #[serde(default)]
    pub timestamp: u64,
}

impl StatusUpdate {
    /// Create a bare status update with only a tag
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            code_payload: None,
            message: None,
            timestamp: 0,
        }
    }

    /// Attach a pairing code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code_payload = Some(code.into());
        self
    }

    /// Attach a detail message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Decode a status update from JSON text
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Response of the pairing code endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCodeResponse {
    pub success: bool,
    pub status: String,
    #[serde(
        default,
        rename = "qr_code",
        alias = "code_payload",
        skip_serializing_if = "Option::is_none"
    )]
    pub code_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response of the backend health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthResponse {
    /// Whether the backend reported itself healthy
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Outer frame received on the status push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl StatusFrame {
    /// Decode a raw push frame into a status update.
    ///
    /// Returns `Ok(None)` for frames without a `data` field; those carry no
    /// status and are skipped by the caller.
    pub fn decode(text: &str) -> Result<Option<StatusUpdate>, DecodeError> {
        let frame: StatusFrame = serde_json::from_str(text)?;
        match frame.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(inner)) => StatusUpdate::decode(&inner).map(Some),
            Some(value @ serde_json::Value::Object(_)) => {
                Ok(Some(serde_json::from_value(value)?))
            }
            Some(other) => Err(DecodeError::UnsupportedData(other.to_string())),
        }
    }

    /// Encode a status update the way the backend relays it
    pub fn encode(update: &StatusUpdate) -> Result<String, DecodeError> {
        let inner = serde_json::to_string(update)?;
        let frame = StatusFrame {
            data: Some(serde_json::Value::String(inner)),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}
