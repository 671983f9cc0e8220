//! Core error types for pairsync

use ps_protocol::DecodeError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the pairsync workspace
#[derive(Error, Debug)]
pub enum PsError {
    /// Synchronization error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the transports and the components driving them
#[derive(Error, Debug)]
pub enum SyncError {
    /// Request/response call failed (transport failure or non-2xx status)
    #[error("Network error: {0}")]
    Network(String),

    /// Push channel reported an error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Push channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Send attempted on a channel that is not open
    #[error("Channel is not open")]
    ChannelNotOpen,

    /// Payload from the backend could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl SyncError {
    /// Whether this error came from a push channel
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            SyncError::Channel(_) | SyncError::ChannelClosed | SyncError::ChannelNotOpen
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
