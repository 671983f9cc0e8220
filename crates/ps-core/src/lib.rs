//! ps-core: State model, errors and configuration for pairsync
//!
//! This crate provides the types shared by the transport client, the status
//! synchronizer and the reply stream consumer, plus the configuration
//! structures the CLI loads from disk.

pub mod config;
pub mod error;
pub mod state;

pub use error::{ConfigError, PsError, SyncError};
pub use state::{
    ConnectionState, Conversation, Message, PairingStatus, ReplyStream, Role, TransportMode,
    TurnState,
};
