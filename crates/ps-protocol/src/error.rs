//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding a payload received from the backend
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload was not valid JSON or did not match the expected shape
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried a `data` field that was neither a string nor an object
    #[error("Unsupported data field: expected string or object, got {0}")]
    UnsupportedData(String),

    /// Chat frame had no `type` tag
    #[error("Frame has no type tag")]
    MissingFrameType,

    /// Chat frame carried a `type` tag this client does not understand
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(String),
}
