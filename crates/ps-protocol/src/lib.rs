//! ps-protocol: Wire payloads for pairsync
//!
//! This crate defines the JSON payloads exchanged with the messaging backend
//! over its request/response endpoints and its two push channels (status and
//! chat). Every payload is a closed type; anything that fails to decode is
//! reported as a [`DecodeError`] rather than passed through untyped.

pub mod chat;
pub mod error;
pub mod status;

pub use chat::{ChatFrame, ChatRequest, ChatResponse, Message, Role};
pub use error::DecodeError;
pub use status::{HealthResponse, PairingCodeResponse, StatusFrame, StatusUpdate};
