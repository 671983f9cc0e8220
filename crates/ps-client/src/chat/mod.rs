//! Streamed assistant replies
//!
//! [`ReplyStreamConsumer`] sends one message per turn over the chat push
//! channel and hands back a [`TurnHandle`] that yields the reply as it
//! streams in.

mod assembler;
mod consumer;

pub use assembler::{ReplyAssembler, ReplyEvent, TurnId};
pub use consumer::{ReplyStreamConsumer, TurnHandle};
