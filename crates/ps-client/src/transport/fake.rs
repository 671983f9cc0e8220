//! Scripted backend for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ps_core::{ConnectionState, SyncError};

use super::{Backend, ChannelKind, ChannelPeer, PushChannel};

type StatusReply = (Duration, Result<ConnectionState, SyncError>);
type CodeReply = (Duration, Result<Option<String>, SyncError>);

/// Backend whose replies are queued by the test.
///
/// When a queue runs dry the fallback status (or `Ok(None)` for codes) is
/// returned immediately.
pub(crate) struct FakeBackend {
    statuses: Mutex<VecDeque<StatusReply>>,
    codes: Mutex<VecDeque<CodeReply>>,
    fallback_status: Mutex<ConnectionState>,
    status_calls: AtomicUsize,
    code_calls: AtomicUsize,
    channel_opens: AtomicUsize,
    peer_tx: mpsc::UnboundedSender<(ChannelKind, ChannelPeer)>,
    peer_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ChannelKind, ChannelPeer)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            statuses: Mutex::new(VecDeque::new()),
            codes: Mutex::new(VecDeque::new()),
            fallback_status: Mutex::new(ConnectionState::default()),
            status_calls: AtomicUsize::new(0),
            code_calls: AtomicUsize::new(0),
            channel_opens: AtomicUsize::new(0),
            peer_tx,
            peer_rx: tokio::sync::Mutex::new(peer_rx),
        }
    }

    pub fn push_status(&self, result: Result<ConnectionState, SyncError>) {
        self.push_status_after(Duration::ZERO, result);
    }

    pub fn push_status_after(&self, delay: Duration, result: Result<ConnectionState, SyncError>) {
        self.statuses.lock().unwrap().push_back((delay, result));
    }

    pub fn push_code(&self, result: Result<Option<String>, SyncError>) {
        self.push_code_after(Duration::ZERO, result);
    }

    pub fn push_code_after(&self, delay: Duration, result: Result<Option<String>, SyncError>) {
        self.codes.lock().unwrap().push_back((delay, result));
    }

    pub fn set_fallback_status(&self, state: ConnectionState) {
        *self.fallback_status.lock().unwrap() = state;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn code_calls(&self) -> usize {
        self.code_calls.load(Ordering::SeqCst)
    }

    pub fn channel_opens(&self) -> usize {
        self.channel_opens.load(Ordering::SeqCst)
    }

    /// Peer of the next channel the client opens
    pub async fn next_peer(&self) -> (ChannelKind, ChannelPeer) {
        self.peer_rx
            .lock()
            .await
            .recv()
            .await
            .expect("backend dropped")
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn fetch_status(&self) -> Result<ConnectionState, SyncError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        match next {
            Some((delay, result)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => Ok(self.fallback_status.lock().unwrap().clone()),
        }
    }

    async fn fetch_pairing_code(&self) -> Result<Option<String>, SyncError> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.codes.lock().unwrap().pop_front();
        match next {
            Some((delay, result)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => Ok(None),
        }
    }

    fn open_channel(&self, kind: ChannelKind) -> PushChannel {
        self.channel_opens.fetch_add(1, Ordering::SeqCst);
        let (channel, peer) = PushChannel::pair();
        let _ = self.peer_tx.send((kind, peer));
        channel
    }
}
