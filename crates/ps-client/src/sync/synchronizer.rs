//! Status synchronizer driver
//!
//! Runs a [`StatusMachine`] on a single task. Fetch results, channel events
//! and timer expirations are all posted to that task's queue, so transitions
//! never overlap. Every spawned helper hangs off the session's
//! [`CancellationToken`]; stopping the session cancels them all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use ps_core::config::ClientConfig;
use ps_core::{ConnectionState, TransportMode};

use super::machine::{Effect, FetchOrigin, StatusMachine, SyncEvent};
use crate::reconnect::ExponentialBackoff;
use crate::transport::{Backend, ChannelEvent, ChannelKind, PushChannel};

/// Capacity of the applied-state broadcast.
///
/// Subscribers that fall further behind than this see `Lagged` and should
/// re-read [`StatusSynchronizer::state`].
const STATE_BROADCAST_CAPACITY: usize = 64;

/// Keeps one pairing session's [`ConnectionState`] in sync with the backend
pub struct StatusSynchronizer<B: Backend> {
    backend: Arc<B>,
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    mode_tx: watch::Sender<TransportMode>,
    updates: broadcast::Sender<ConnectionState>,
    session: Option<Session>,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<B: Backend> StatusSynchronizer<B> {
    /// Create a stopped synchronizer
    pub fn new(backend: Arc<B>, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (mode_tx, _) = watch::channel(TransportMode::None);
        let (updates, _) = broadcast::channel(STATE_BROADCAST_CAPACITY);
        Self {
            backend,
            config: config.clone(),
            state_tx,
            mode_tx,
            updates,
            session: None,
        }
    }

    /// Start synchronizing. Does nothing if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        // Each run starts from a fresh state, not the previous run's last one
        let fresh = ConnectionState::default();
        if *self.state_tx.borrow() != fresh {
            self.state_tx.send_replace(fresh.clone());
            let _ = self.updates.send(fresh);
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            backend: Arc::clone(&self.backend),
            machine: StatusMachine::new(self.config.push_stall_timeout.is_some()),
            poll_interval: self.config.poll_interval,
            stall_timeout: self.config.push_stall_timeout,
            reopen_backoff: ExponentialBackoff::from_config(&self.config.backoff),
            tx,
            session: cancel.clone(),
            channel: None,
            next_channel_id: 0,
            poll: None,
            stall: None,
            stall_generation: 0,
            state_tx: self.state_tx.clone(),
            mode_tx: self.mode_tx.clone(),
            updates: self.updates.clone(),
        };

        tracing::debug!(api_url = %self.config.api_url, "Starting status synchronizer");
        let task = tokio::spawn(driver.run(rx));
        self.session = Some(Session { cancel, task });
    }

    /// Stop synchronizing, closing the channel and any poll timer.
    ///
    /// Safe to call when already stopped.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            tracing::warn!("Status synchronizer task ended abnormally: {}", e);
        }
        tracing::debug!("Status synchronizer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Currently applied state
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Currently authoritative transport
    pub fn mode(&self) -> TransportMode {
        *self.mode_tx.borrow()
    }

    /// Every applied state, in order
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.updates.subscribe()
    }

    /// Latest applied state, for callers that only need the current value
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Latest transport mode
    pub fn watch_mode(&self) -> watch::Receiver<TransportMode> {
        self.mode_tx.subscribe()
    }
}

impl<B: Backend> Drop for StatusSynchronizer<B> {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// Item on the driver queue
enum Queued {
    Event(SyncEvent),
    Channel { id: u64, event: ChannelEvent },
    Stalled { generation: u64 },
}

struct ActiveChannel {
    id: u64,
    channel: PushChannel,
    cancel: CancellationToken,
}

struct Driver<B: Backend> {
    backend: Arc<B>,
    machine: StatusMachine,
    poll_interval: Duration,
    stall_timeout: Option<Duration>,
    reopen_backoff: ExponentialBackoff,
    tx: mpsc::UnboundedSender<Queued>,
    session: CancellationToken,
    channel: Option<ActiveChannel>,
    next_channel_id: u64,
    poll: Option<CancellationToken>,
    stall: Option<CancellationToken>,
    stall_generation: u64,
    state_tx: watch::Sender<ConnectionState>,
    mode_tx: watch::Sender<TransportMode>,
    updates: broadcast::Sender<ConnectionState>,
}

impl<B: Backend> Driver<B> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Queued>) {
        self.dispatch(SyncEvent::Start);

        loop {
            let queued = tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                queued = rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            match queued {
                Queued::Event(event) => self.dispatch(event),
                Queued::Channel { id, event } => {
                    if self.channel.as_ref().map(|c| c.id) != Some(id) {
                        tracing::trace!(id, ?event, "Dropping event from retired channel");
                        continue;
                    }
                    let event = match event {
                        ChannelEvent::Opened => SyncEvent::ChannelOpened,
                        ChannelEvent::Message(text) => SyncEvent::ChannelMessage(text),
                        ChannelEvent::Error(reason) => SyncEvent::ChannelError(reason),
                        ChannelEvent::Closed => SyncEvent::ChannelClosed,
                    };
                    self.dispatch(event);
                }
                Queued::Stalled { generation } => {
                    if generation == self.stall_generation {
                        self.dispatch(SyncEvent::PushStalled);
                    }
                }
            }
        }

        self.dispatch(SyncEvent::Stop);
        self.session.cancel();
    }

    fn dispatch(&mut self, event: SyncEvent) {
        let before = self.machine.mode();
        for effect in self.machine.handle(event) {
            self.execute(effect);
        }

        let after = self.machine.mode();
        if before != after {
            tracing::info!(from = %before, mode = %after, "Transport mode changed");
            if after == TransportMode::Push {
                self.reopen_backoff.reset();
            }
            self.mode_tx.send_replace(after);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::FetchStatus { origin, epoch } => self.spawn_status_fetch(origin, epoch),
            Effect::FetchPairingCode => self.spawn_code_fetch(),
            Effect::OpenChannel => self.open_channel(),
            Effect::CloseChannel => self.close_channel(),
            Effect::StartPolling => self.start_polling(),
            Effect::StopPolling => {
                if let Some(poll) = self.poll.take() {
                    poll.cancel();
                    tracing::debug!("Poll loop stopped");
                }
            }
            Effect::ArmStallTimer => self.arm_stall_timer(),
            Effect::ScheduleReopen => self.schedule_reopen(),
            Effect::Publish(state) => {
                tracing::info!(state = %state, "Connection state updated");
                self.state_tx.send_replace(state.clone());
                // No subscribers is fine
                let _ = self.updates.send(state);
            }
        }
    }

    fn spawn_status_fetch(&self, origin: FetchOrigin, epoch: u64) {
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        let cancel = self.session.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = backend.fetch_status() => {
                    let _ = tx.send(Queued::Event(SyncEvent::StatusFetched { origin, epoch, result }));
                }
            }
        });
    }

    fn spawn_code_fetch(&self) {
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        let cancel = self.session.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = backend.fetch_pairing_code() => {
                    let _ = tx.send(Queued::Event(SyncEvent::PairingCodeFetched(result)));
                }
            }
        });
    }

    fn open_channel(&mut self) {
        self.close_channel();

        let mut channel = self.backend.open_channel(ChannelKind::Status);
        self.next_channel_id += 1;
        let id = self.next_channel_id;
        let cancel = self.session.child_token();

        match channel.take_events() {
            Some(mut events) => {
                let tx = self.tx.clone();
                let forward_cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = forward_cancel.cancelled() => break,
                            event = events.recv() => match event {
                                Some(event) => {
                                    if tx.send(Queued::Channel { id, event }).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                });
            }
            None => tracing::warn!(id, "Status channel events already taken"),
        }

        tracing::debug!(id, "Status channel opening");
        self.channel = Some(ActiveChannel {
            id,
            channel,
            cancel,
        });
    }

    fn close_channel(&mut self) {
        if let Some(stall) = self.stall.take() {
            stall.cancel();
        }
        if let Some(active) = self.channel.take() {
            active.cancel.cancel();
            active.channel.close();
            tracing::debug!(id = active.id, "Status channel closed");
        }
    }

    fn start_polling(&mut self) {
        if let Some(previous) = self.poll.take() {
            previous.cancel();
        }

        let period = self.poll_interval;
        let tx = self.tx.clone();
        let cancel = self.session.child_token();
        self.poll = Some(cancel.clone());

        tracing::debug!(interval = ?period, "Poll loop started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(Queued::Event(SyncEvent::PollTick)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn arm_stall_timer(&mut self) {
        let (Some(timeout), Some(active)) = (self.stall_timeout, self.channel.as_ref()) else {
            return;
        };
        if let Some(previous) = self.stall.take() {
            previous.cancel();
        }

        self.stall_generation += 1;
        let generation = self.stall_generation;
        let tx = self.tx.clone();
        let cancel = active.cancel.child_token();
        self.stall = Some(cancel.clone());

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(Queued::Stalled { generation });
                }
            }
        });
    }

    fn schedule_reopen(&mut self) {
        let Some(delay) = self.reopen_backoff.next_delay() else {
            tracing::warn!(
                attempts = self.reopen_backoff.attempts(),
                "Status channel unavailable, continuing with polling only"
            );
            return;
        };

        tracing::debug!(?delay, attempt = self.reopen_backoff.attempts(), "Status channel reopen scheduled");
        let tx = self.tx.clone();
        let cancel = self.session.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Queued::Event(SyncEvent::ReopenChannel));
                }
            }
        });
    }
}
