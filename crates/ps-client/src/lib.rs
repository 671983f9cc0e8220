//! ps-client: Realtime sync layer for pairsync
//!
//! Keeps a client's view of the backend consistent over two transports:
//! WebSocket push channels when they are available and HTTP polling when
//! they are not.
//!
//! - [`transport`]: the [`Backend`](transport::Backend) seam, the HTTP
//!   implementation and push channel handles
//! - [`sync`]: the pairing status synchronizer
//! - [`chat`]: the streamed reply consumer
//! - [`reconnect`]: backoff for recreating channels

pub mod chat;
pub mod reconnect;
pub mod sync;
pub mod transport;

pub use chat::{ReplyEvent, ReplyStreamConsumer, TurnHandle};
pub use reconnect::ExponentialBackoff;
pub use sync::StatusSynchronizer;
pub use transport::{Backend, ChannelKind, HttpBackend, PushChannel};
