//! Reply stream consumer driver
//!
//! One dispatcher task per consumer owns the [`ReplyAssembler`]. Channel
//! events reach it through a forwarder that stamps each event with the turn
//! its channel is currently carrying; turn starts are posted to the same
//! queue before the outbound message is written, so a reply can never be
//! dispatched ahead of the turn it belongs to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use ps_core::config::ClientConfig;
use ps_core::{Message, ReplyStream, SyncError};
use ps_protocol::ChatRequest;

use super::assembler::{ReplyAssembler, ReplyEvent, TurnId, SUPERSEDED};
use crate::transport::{Backend, ChannelEvent, ChannelKind, PushChannel};

const CONSUMER_CLOSED: &str = "Reply consumer closed";
const STREAM_LOST: &str = "Reply stream ended unexpectedly";

/// Queue item for the dispatcher
enum Dispatch {
    Begin {
        turn: TurnId,
        sink: mpsc::UnboundedSender<ReplyEvent>,
    },
    Channel {
        turn: TurnId,
        event: ChannelEvent,
    },
    Abandon {
        turn: TurnId,
        reason: String,
    },
}

/// Dispatcher view published after every step
#[derive(Debug, Clone, Default)]
struct Snapshot {
    turn: Option<TurnId>,
    stream: ReplyStream,
}

struct ChatChannel {
    channel: PushChannel,
    current_turn: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ChatChannel {
    fn retire(self) {
        self.cancel.cancel();
        self.channel.close();
    }
}

/// Streams assistant replies over the chat push channel
pub struct ReplyStreamConsumer<B: Backend> {
    backend: Arc<B>,
    open_timeout: Duration,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    snapshot: watch::Receiver<Snapshot>,
    channel: Option<ChatChannel>,
    last_turn: Option<TurnId>,
    next_turn: TurnId,
    cancel: CancellationToken,
}

impl<B: Backend> ReplyStreamConsumer<B> {
    /// Create a consumer. The chat channel is opened by the first turn.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(backend: Arc<B>, config: &ClientConfig) -> Self {
        let (dispatch, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::default());
        let cancel = CancellationToken::new();
        tokio::spawn(run_dispatcher(rx, snapshot_tx, cancel.clone()));

        Self {
            backend,
            open_timeout: config.request_timeout,
            dispatch,
            snapshot,
            channel: None,
            last_turn: None,
            next_turn: 1,
            cancel,
        }
    }

    /// Send `message` and start streaming its reply.
    ///
    /// Opens the chat channel on first use and reuses it afterwards. A turn
    /// still pending is superseded: its channel is replaced by a fresh one so
    /// none of its frames reach the new turn. Fails with
    /// [`SyncError::ChannelNotOpen`] when the reused channel has closed; call
    /// [`reconnect`](Self::reconnect) before retrying.
    pub async fn start_turn(
        &mut self,
        message: &str,
        history: &[Message],
    ) -> Result<TurnHandle, SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ChannelNotOpen);
        }

        if self.channel.is_none() {
            self.open_channel().await?;
        } else if self.has_pending_turn() {
            tracing::debug!(turn = ?self.last_turn, "Superseding pending turn on a fresh channel");
            self.abandon_pending(SUPERSEDED);
            self.open_channel().await?;
        }

        let chat = self.channel.as_ref().ok_or(SyncError::ChannelNotOpen)?;
        if !chat.channel.is_open() {
            return Err(SyncError::ChannelNotOpen);
        }

        let payload = ChatRequest::new(message, history).to_json()?;
        let turn = self.next_turn;
        self.next_turn += 1;

        let (sink, events) = mpsc::unbounded_channel();
        chat.current_turn.store(turn, Ordering::SeqCst);
        self.dispatch
            .send(Dispatch::Begin { turn, sink })
            .map_err(|_| SyncError::ChannelNotOpen)?;
        self.last_turn = Some(turn);

        if let Err(e) = chat.channel.send(payload) {
            // Nothing was sent, so the turn must not count as pending
            tracing::warn!(turn, "Chat message not sent: {}", e);
            chat.current_turn.store(0, Ordering::SeqCst);
            let _ = self.dispatch.send(Dispatch::Abandon {
                turn,
                reason: e.to_string(),
            });
            self.last_turn = None;
            return Err(e);
        }
        tracing::debug!(turn, history = history.len(), "Chat turn started");

        Ok(TurnHandle {
            turn,
            events,
            stream: ReplyStream::new(),
        })
    }

    /// Replace the chat channel with a new one and wait for it to open.
    ///
    /// A turn still pending on the old channel fails.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ChannelNotOpen);
        }
        self.abandon_pending("Chat channel replaced");
        self.open_channel().await
    }

    /// Whether the current chat channel accepts turns
    pub fn is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|chat| chat.channel.is_open())
    }

    /// Snapshot of the latest turn's stream
    pub fn current_stream(&self) -> ReplyStream {
        self.snapshot.borrow().stream.clone()
    }

    /// Close the channel and fail any pending turn. Safe to call twice.
    pub fn close(&mut self) {
        self.abandon_pending(CONSUMER_CLOSED);
        if let Some(chat) = self.channel.take() {
            chat.retire();
        }
        self.cancel.cancel();
    }

    fn has_pending_turn(&self) -> bool {
        let Some(turn) = self.last_turn else {
            return false;
        };
        let snapshot = self.snapshot.borrow();
        !(snapshot.turn == Some(turn) && snapshot.stream.is_terminal())
    }

    fn abandon_pending(&mut self, reason: &str) {
        if let Some(turn) = self.last_turn {
            if self.has_pending_turn() {
                let _ = self.dispatch.send(Dispatch::Abandon {
                    turn,
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn open_channel(&mut self) -> Result<(), SyncError> {
        if let Some(previous) = self.channel.take() {
            previous.retire();
        }

        let mut channel = self.backend.open_channel(ChannelKind::Chat);
        let events = channel.take_events().ok_or(SyncError::ChannelNotOpen)?;
        let current_turn = Arc::new(AtomicU64::new(0));
        let cancel = self.cancel.child_token();

        tokio::spawn(forward_events(
            events,
            Arc::clone(&current_turn),
            self.dispatch.clone(),
            cancel.clone(),
        ));

        let opened = tokio::time::timeout(self.open_timeout, channel.wait_open()).await;
        self.channel = Some(ChatChannel {
            channel,
            current_turn,
            cancel,
        });

        match opened {
            Ok(Ok(())) => {
                tracing::debug!("Chat channel open");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("Chat channel failed to open: {}", e);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.open_timeout, "Chat channel open timed out");
                if let Some(chat) = &self.channel {
                    chat.channel.close();
                }
                Err(SyncError::Channel("Timed out opening chat channel".to_string()))
            }
        }
    }
}

impl<B: Backend> Drop for ReplyStreamConsumer<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_events(
    mut events: mpsc::Receiver<ChannelEvent>,
    current_turn: Arc<AtomicU64>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let turn = current_turn.load(Ordering::SeqCst);
                if dispatch.send(Dispatch::Channel { turn, event }).is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    snapshot: watch::Sender<Snapshot>,
    cancel: CancellationToken,
) {
    let mut assembler = ReplyAssembler::new();
    let mut sink: Option<TurnSink> = None;

    loop {
        let item = tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let (target, events) = match item {
            Dispatch::Begin { turn, sink: next } => {
                let closing = assembler.begin(turn);
                (sink.replace((turn, next)), closing)
            }
            Dispatch::Channel { turn, event } => {
                let events = match event {
                    ChannelEvent::Opened => Vec::new(),
                    ChannelEvent::Message(text) => assembler.on_frame(turn, &text),
                    ChannelEvent::Error(reason) => {
                        tracing::warn!(turn, %reason, "Chat channel error");
                        assembler.on_channel_error(turn, &reason)
                    }
                    ChannelEvent::Closed => assembler.on_channel_closed(turn),
                };
                (sink_for(&sink, turn), events)
            }
            Dispatch::Abandon { turn, reason } => {
                let events = assembler.on_channel_error(turn, &reason);
                (sink_for(&sink, turn), events)
            }
        };

        // Publish before delivering so a caller that saw the terminal event
        // also sees the terminal snapshot
        snapshot.send_replace(Snapshot {
            turn: assembler.active_turn(),
            stream: assembler.stream().clone(),
        });
        deliver(target, events);
    }

    if let Some(turn) = assembler.active_turn() {
        let events = assembler.on_channel_error(turn, CONSUMER_CLOSED);
        deliver(sink_for(&sink, turn), events);
    }
}

type TurnSink = (TurnId, mpsc::UnboundedSender<ReplyEvent>);

fn sink_for(sink: &Option<TurnSink>, turn: TurnId) -> Option<TurnSink> {
    sink.as_ref().filter(|(sink_turn, _)| *sink_turn == turn).cloned()
}

fn deliver(target: Option<TurnSink>, events: Vec<ReplyEvent>) {
    let Some((_, tx)) = target else {
        return;
    };
    for event in events {
        // The caller may have dropped its handle
        let _ = tx.send(event);
    }
}

/// Receives the reply of one turn
#[derive(Debug)]
pub struct TurnHandle {
    turn: TurnId,
    events: mpsc::UnboundedReceiver<ReplyEvent>,
    stream: ReplyStream,
}

impl TurnHandle {
    pub fn id(&self) -> TurnId {
        self.turn
    }

    /// Next event of this turn, or `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        if self.stream.is_terminal() {
            return None;
        }

        let event = match self.events.recv().await {
            Some(event) => event,
            None => ReplyEvent::Failed(STREAM_LOST.to_string()),
        };
        match &event {
            ReplyEvent::Fragment(text) => {
                self.stream.push_fragment(text.clone());
            }
            ReplyEvent::Completed(_) => {
                self.stream.complete();
            }
            ReplyEvent::Failed(message) => {
                self.stream.fail(message.clone());
            }
        }
        Some(event)
    }

    /// Wait for the turn to end and return its stream
    pub async fn collect(mut self) -> ReplyStream {
        while self.next_event().await.is_some() {}
        self.stream
    }

    /// Stream received so far
    pub fn stream(&self) -> &ReplyStream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeBackend;
    use crate::transport::ChannelPeer;
    use ps_core::TurnState;

    fn consumer(backend: &Arc<FakeBackend>) -> ReplyStreamConsumer<FakeBackend> {
        ReplyStreamConsumer::new(Arc::clone(backend), &ClientConfig::default())
    }

    /// Start a turn, completing the handshake of a newly opened channel
    async fn start(
        consumer: &mut ReplyStreamConsumer<FakeBackend>,
        backend: &Arc<FakeBackend>,
        message: &str,
    ) -> (TurnHandle, ChannelPeer) {
        let opener = {
            let backend = Arc::clone(backend);
            tokio::spawn(async move {
                let (kind, peer) = backend.next_peer().await;
                assert_eq!(kind, ChannelKind::Chat);
                peer.open().await;
                peer
            })
        };
        let handle = consumer.start_turn(message, &[]).await.unwrap();
        (handle, opener.await.unwrap())
    }

    fn chunk(content: &str) -> String {
        format!(r#"{{"type":"chunk","content":"{}"}}"#, content)
    }

    #[tokio::test]
    async fn test_streamed_reply_completes() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (mut handle, mut peer) = start(&mut consumer, &backend, "hi").await;

        let sent = peer.recv_sent().await.unwrap();
        assert_eq!(sent, r#"{"message":"hi"}"#);

        peer.message(chunk("Hel")).await;
        peer.message(chunk("lo")).await;
        peer.message(r#"{"type":"end"}"#).await;

        assert_eq!(handle.next_event().await, Some(ReplyEvent::Fragment("Hel".into())));
        assert_eq!(handle.next_event().await, Some(ReplyEvent::Fragment("lo".into())));
        assert_eq!(
            handle.next_event().await,
            Some(ReplyEvent::Completed("Hello".into()))
        );
        assert_eq!(handle.next_event().await, None);
        assert_eq!(handle.stream().fragments(), ["Hel", "lo"]);
        assert_eq!(handle.stream().state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn test_history_is_sent_and_channel_reused() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, mut peer) = start(&mut consumer, &backend, "first").await;
        peer.recv_sent().await.unwrap();
        peer.message(r#"{"type":"end"}"#).await;
        let stream = handle.collect().await;
        assert_eq!(stream.state(), TurnState::Completed);

        assert!(consumer.current_stream().is_terminal());

        let history = [Message::user("first"), Message::assistant("")];
        let _second = consumer.start_turn("second", &history).await.unwrap();
        let sent = peer.recv_sent().await.unwrap();
        assert!(sent.contains(r#""message":"second""#));
        assert!(sent.contains(r#""history""#));
        assert_eq!(backend.channel_opens(), 1);
    }

    #[tokio::test]
    async fn test_server_error_fails_turn() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, peer) = start(&mut consumer, &backend, "hi").await;

        peer.message(chunk("par")).await;
        peer.message(r#"{"type":"error","message":"model unavailable"}"#)
            .await;
        peer.message(chunk("ignored")).await;

        let stream = handle.collect().await;
        assert_eq!(stream.state(), TurnState::Failed);
        assert_eq!(stream.error(), Some("model unavailable"));
        assert_eq!(stream.text(), "par");
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, peer) = start(&mut consumer, &backend, "").await;

        peer.message(r#"{"error":"Empty message"}"#).await;
        peer.message("garbage").await;
        peer.message(chunk("ok")).await;
        peer.message(r#"{"type":"end"}"#).await;

        let stream = handle.collect().await;
        assert_eq!(stream.state(), TurnState::Completed);
        assert_eq!(stream.text(), "ok");
    }

    #[tokio::test]
    async fn test_channel_failure_yields_single_failed_event() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (mut handle, peer) = start(&mut consumer, &backend, "hi").await;

        peer.error("connection reset").await;

        assert_eq!(
            handle.next_event().await,
            Some(ReplyEvent::Failed("connection reset".into()))
        );
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn test_closed_channel_requires_reconnect() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, peer) = start(&mut consumer, &backend, "hi").await;
        peer.message(r#"{"type":"end"}"#).await;
        handle.collect().await;
        peer.close().await;

        let result = consumer.start_turn("again", &[]).await;
        assert!(matches!(result, Err(SyncError::ChannelNotOpen)));
        assert!(!consumer.is_open());

        let opener = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                let (_, peer) = backend.next_peer().await;
                peer.open().await;
                peer
            })
        };
        consumer.reconnect().await.unwrap();
        let mut peer = opener.await.unwrap();

        let handle = consumer.start_turn("again", &[]).await.unwrap();
        assert_eq!(peer.recv_sent().await.unwrap(), r#"{"message":"again"}"#);
        peer.message(r#"{"type":"end"}"#).await;
        assert_eq!(handle.collect().await.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_pending_turn() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, peer) = start(&mut consumer, &backend, "hi").await;
        peer.message(r#"{"type":"end"}"#).await;
        handle.collect().await;

        // The server side goes away without a close frame
        drop(peer);
        assert!(consumer.is_open());
        assert!(matches!(
            consumer.start_turn("again", &[]).await,
            Err(SyncError::ChannelNotOpen)
        ));

        // No turn was left behind to supersede, so no channel is opened
        assert!(matches!(
            consumer.start_turn("again", &[]).await,
            Err(SyncError::ChannelNotOpen)
        ));
        assert_eq!(backend.channel_opens(), 1);
    }

    #[tokio::test]
    async fn test_superseded_turn_fails_and_stale_frames_are_dropped() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (first, old_peer) = start(&mut consumer, &backend, "one").await;
        old_peer.message(chunk("from-one")).await;

        let (second, new_peer) = start(&mut consumer, &backend, "two").await;
        assert!(old_peer.is_closed_by_client());
        assert_eq!(backend.channel_opens(), 2);

        // Late frames on the retired channel go nowhere
        old_peer.message(chunk("stale")).await;
        new_peer.message(chunk("from-two")).await;
        new_peer.message(r#"{"type":"end"}"#).await;

        let first = first.collect().await;
        assert_eq!(first.state(), TurnState::Failed);
        assert_eq!(first.error(), Some(SUPERSEDED));

        let second = second.collect().await;
        assert_eq!(second.fragments(), ["from-two"]);
        assert_eq!(second.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn test_close_fails_pending_turn_and_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let mut consumer = consumer(&backend);
        let (handle, peer) = start(&mut consumer, &backend, "hi").await;

        consumer.close();
        consumer.close();
        assert!(peer.is_closed_by_client());

        let stream = handle.collect().await;
        assert_eq!(stream.state(), TurnState::Failed);
        assert!(matches!(
            consumer.start_turn("more", &[]).await,
            Err(SyncError::ChannelNotOpen)
        ));
    }
}
