//! Push channel handle
//!
//! A [`PushChannel`] is returned immediately by `open`; the WebSocket
//! handshake runs on a background task and reports progress through
//! [`ChannelEvent`]s. Closing the handle (or dropping it) cancels that task.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;

use ps_core::SyncError;

/// Channel capacity for inbound channel events.
///
/// The reader task waits when the buffer is full, which pushes back on the
/// socket instead of dropping frames.
const CHANNEL_EVENT_CAPACITY: usize = 256;

/// Which backend push channel to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Pairing/connection status updates
    Status,
    /// Streamed assistant replies
    Chat,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Status => write!(f, "status"),
            ChannelKind::Chat => write!(f, "chat"),
        }
    }
}

/// Lifecycle of a push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Event emitted by a push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake completed; sends are accepted from now on
    Opened,
    /// Text frame from the server
    Message(String),
    /// Transport failure. A `Closed` event follows.
    Error(String),
    /// Channel ended
    Closed,
}

/// Handle to a persistent duplex channel
pub struct PushChannel {
    state: Arc<watch::Sender<ChannelState>>,
    outbound: mpsc::UnboundedSender<String>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    cancel: CancellationToken,
}

impl PushChannel {
    /// Open a WebSocket channel to `url` without waiting for the handshake
    pub fn connect(url: impl Into<String>) -> Self {
        let url = url.into();
        let (channel, io) = Self::with_parts();
        tokio::spawn(run_websocket(url, io));
        channel
    }

    /// Create an in-memory channel driven by the returned [`ChannelPeer`]
    pub fn pair() -> (Self, ChannelPeer) {
        let (channel, io) = Self::with_parts();
        let peer = ChannelPeer {
            state: io.state,
            events: io.events,
            outbound: io.outbound,
            cancel: io.cancel,
        };
        (channel, peer)
    }

    fn with_parts() -> (Self, ChannelIo) {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let state = Arc::new(state_tx);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let channel = Self {
            state: Arc::clone(&state),
            outbound: outbound_tx,
            events: Some(event_rx),
            cancel: cancel.clone(),
        };
        let io = ChannelIo {
            state,
            events: event_tx,
            outbound: outbound_rx,
            cancel,
        };
        (channel, io)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Send a text frame.
    ///
    /// Fails with [`SyncError::ChannelNotOpen`] unless the channel is open.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SyncError> {
        if !self.is_open() {
            return Err(SyncError::ChannelNotOpen);
        }
        self.outbound
            .send(text.into())
            .map_err(|_| SyncError::ChannelNotOpen)
    }

    /// Take the event receiver. Returns `None` once taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    /// Wait until the channel leaves `Connecting`
    pub async fn wait_open(&self) -> Result<(), SyncError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        match state {
            ChannelState::Open => Ok(()),
            _ => Err(SyncError::ChannelClosed),
        }
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
        self.state.send_replace(ChannelState::Closed);
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("state", &self.state())
            .finish()
    }
}

/// Driver side of a channel
struct ChannelIo {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl ChannelIo {
    async fn emit(&self, event: ChannelEvent) {
        // The owner may have dropped the receiver; nothing to report to then
        let _ = self.events.send(event).await;
    }

    async fn fail(&self, reason: String) {
        self.state.send_replace(ChannelState::Closed);
        self.emit(ChannelEvent::Error(reason)).await;
        self.emit(ChannelEvent::Closed).await;
    }

    async fn closed(&self) {
        self.state.send_replace(ChannelState::Closed);
        self.emit(ChannelEvent::Closed).await;
    }
}

async fn run_websocket(url: String, mut io: ChannelIo) {
    tracing::debug!(%url, "Opening push channel");

    let connected = tokio::select! {
        _ = io.cancel.cancelled() => {
            io.state.send_replace(ChannelState::Closed);
            return;
        }
        result = connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            tracing::debug!(%url, "Push channel connect failed: {}", e);
            io.fail(e.to_string()).await;
            return;
        }
    };

    // Closed by the owner while the handshake was finishing
    if io.cancel.is_cancelled() {
        return;
    }

    io.state.send_replace(ChannelState::Open);
    io.emit(ChannelEvent::Opened).await;
    tracing::debug!(%url, "Push channel open");

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            _ = io.cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                io.state.send_replace(ChannelState::Closed);
                tracing::debug!(%url, "Push channel closed locally");
                return;
            }
            outbound = io.outbound.recv() => {
                let Some(text) = outbound else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    io.state.send_replace(ChannelState::Closed);
                    return;
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    io.fail(e.to_string()).await;
                    return;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    io.emit(ChannelEvent::Message(text)).await;
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => io.emit(ChannelEvent::Message(text)).await,
                    Err(_) => tracing::warn!(%url, "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(%url, ?frame, "Push channel closed by server");
                    io.closed().await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(%url, "Push channel error: {}", e);
                    io.fail(e.to_string()).await;
                    return;
                }
                None => {
                    io.closed().await;
                    return;
                }
            },
        }
    }
}

/// Remote end of an in-memory channel created by [`PushChannel::pair`]
pub struct ChannelPeer {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl ChannelPeer {
    /// Complete the handshake
    pub async fn open(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.state.send_replace(ChannelState::Open);
        let _ = self.events.send(ChannelEvent::Opened).await;
    }

    /// Deliver a text frame
    pub async fn message(&self, text: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Message(text.into())).await;
    }

    /// Fail the channel; emits `Error` then `Closed`
    pub async fn error(&self, reason: impl Into<String>) {
        self.state.send_replace(ChannelState::Closed);
        let _ = self.events.send(ChannelEvent::Error(reason.into())).await;
        let _ = self.events.send(ChannelEvent::Closed).await;
    }

    /// End the channel from the server side
    pub async fn close(&self) {
        self.state.send_replace(ChannelState::Closed);
        let _ = self.events.send(ChannelEvent::Closed).await;
    }

    /// Next frame sent by the client, or `None` once the client hung up
    pub async fn recv_sent(&mut self) -> Option<String> {
        tokio::select! {
            text = self.outbound.recv() => text,
            _ = self.cancel.cancelled() => self.outbound.try_recv().ok(),
        }
    }

    /// Whether the client closed or dropped its handle
    pub fn is_closed_by_client(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
