//! pairsync CLI
//!
//! Provides the `pairsync` command for watching pairing status and chatting
//! with the backend agent over streamed replies.

pub mod commands;
pub mod output;
