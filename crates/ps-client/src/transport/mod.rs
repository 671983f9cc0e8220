//! Transport client
//!
//! Thin request/response and push-channel access to the backend. Nothing
//! here retries or holds session state; callers own both.

mod channel;
mod http;

#[cfg(test)]
pub(crate) mod fake;

pub use channel::{ChannelEvent, ChannelKind, ChannelPeer, ChannelState, PushChannel};
pub use http::HttpBackend;

use async_trait::async_trait;

use ps_core::{ConnectionState, SyncError};

/// Operations the synchronizer and the reply consumer need from a backend
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch the current connection status
    async fn fetch_status(&self) -> Result<ConnectionState, SyncError>;

    /// Fetch the pairing code. `Ok(None)` when the backend has none to give.
    async fn fetch_pairing_code(&self) -> Result<Option<String>, SyncError>;

    /// Open a push channel. Returns without waiting for the handshake.
    fn open_channel(&self, kind: ChannelKind) -> PushChannel;
}
