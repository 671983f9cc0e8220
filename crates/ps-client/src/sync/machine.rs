//! Status state machine
//!
//! [`StatusMachine`] holds the applied [`ConnectionState`] and the active
//! [`TransportMode`] and maps each [`SyncEvent`] to the [`Effect`]s the
//! driver must execute. It performs no I/O.
//!
//! # Authority
//!
//! Every status fetch is stamped with the machine's authority epoch. The
//! epoch advances when the first push message of a push period is applied,
//! so fetch results issued before that point (including a poll already in
//! flight) are discarded when they arrive. Falling back to polling starts a
//! new push period without advancing the epoch, since no fetches are issued
//! while push is confirmed.
//!
//! # Recovery
//!
//! While polling, the status channel is reopened on a backoff schedule. A
//! reopened channel does not take over until it delivers a status message;
//! until then the poll loop stays authoritative.

use ps_core::{ConnectionState, SyncError, TransportMode};
use ps_protocol::StatusFrame;

/// Why a status fetch was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// Initial pull at start
    Start,
    /// Poll loop tick
    Poll,
}

/// Input to the state machine
#[derive(Debug)]
pub enum SyncEvent {
    Start,
    StatusFetched {
        origin: FetchOrigin,
        epoch: u64,
        result: Result<ConnectionState, SyncError>,
    },
    PairingCodeFetched(Result<Option<String>, SyncError>),
    ChannelOpened,
    ChannelMessage(String),
    ChannelError(String),
    ChannelClosed,
    PollTick,
    PushStalled,
    /// Backoff delay elapsed; try the status channel again
    ReopenChannel,
    Stop,
}

/// Work requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchStatus { origin: FetchOrigin, epoch: u64 },
    FetchPairingCode,
    OpenChannel,
    CloseChannel,
    StartPolling,
    StopPolling,
    /// (Re)start the silence timer on the status channel
    ArmStallTimer,
    /// Post `ReopenChannel` after the next backoff delay
    ScheduleReopen,
    Publish(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelPhase {
    Idle,
    Connecting,
    Open,
}

/// Pure transition logic of the status synchronizer
#[derive(Debug)]
pub struct StatusMachine {
    running: bool,
    state: ConnectionState,
    mode: TransportMode,
    channel: ChannelPhase,
    epoch: u64,
    push_confirmed: bool,
    code_in_flight: bool,
    poll_in_flight: bool,
    stall_detection: bool,
}

impl StatusMachine {
    /// Create a stopped machine. `stall_detection` enables `ArmStallTimer`.
    pub fn new(stall_detection: bool) -> Self {
        Self {
            running: false,
            state: ConnectionState::default(),
            mode: TransportMode::None,
            channel: ChannelPhase::Idle,
            epoch: 0,
            push_confirmed: false,
            code_in_flight: false,
            poll_in_flight: false,
            stall_detection,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Apply one event and return the effects to execute, in order
    pub fn handle(&mut self, event: SyncEvent) -> Vec<Effect> {
        match event {
            SyncEvent::Start => self.on_start(),
            SyncEvent::Stop => self.on_stop(),
            _ if !self.running => {
                tracing::trace!(?event, "Ignoring event while stopped");
                Vec::new()
            }
            SyncEvent::StatusFetched {
                origin,
                epoch,
                result,
            } => self.on_status_fetched(origin, epoch, result),
            SyncEvent::PairingCodeFetched(result) => self.on_code_fetched(result),
            SyncEvent::ChannelOpened => self.on_channel_opened(),
            SyncEvent::ChannelMessage(text) => self.on_channel_message(&text),
            SyncEvent::ChannelError(reason) => {
                tracing::warn!(%reason, "Status channel error");
                self.on_channel_ended()
            }
            SyncEvent::ChannelClosed => self.on_channel_ended(),
            SyncEvent::PollTick => self.on_poll_tick(),
            SyncEvent::PushStalled => self.on_push_stalled(),
            SyncEvent::ReopenChannel => self.on_reopen(),
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.running {
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.running = true;
        self.mode = TransportMode::None;
        self.channel = ChannelPhase::Connecting;
        self.epoch += 1;
        self.push_confirmed = false;
        self.code_in_flight = false;
        self.poll_in_flight = false;
        self.apply(ConnectionState::default(), &mut effects);

        effects.push(Effect::FetchStatus {
            origin: FetchOrigin::Start,
            epoch: self.epoch,
        });
        effects.push(Effect::OpenChannel);
        self.arm_stall_timer(&mut effects);
        effects
    }

    fn on_stop(&mut self) -> Vec<Effect> {
        self.running = false;
        self.mode = TransportMode::None;
        self.channel = ChannelPhase::Idle;
        self.code_in_flight = false;
        self.poll_in_flight = false;
        vec![Effect::StopPolling, Effect::CloseChannel]
    }

    fn on_status_fetched(
        &mut self,
        origin: FetchOrigin,
        epoch: u64,
        result: Result<ConnectionState, SyncError>,
    ) -> Vec<Effect> {
        if origin == FetchOrigin::Poll {
            self.poll_in_flight = false;
        }
        if epoch != self.epoch {
            tracing::debug!(?origin, "Discarding status fetched before push took over");
            return Vec::new();
        }

        let mut effects = Vec::new();
        match result {
            Ok(update) => {
                let merged = self.state.merge(update);
                self.apply(merged, &mut effects);
                self.request_code_if_needed(&mut effects);
            }
            Err(e) => {
                tracing::warn!(?origin, "Status fetch failed: {}", e);
                self.apply(ConnectionState::error(e.to_string()), &mut effects);
            }
        }
        effects
    }

    fn on_code_fetched(&mut self, result: Result<Option<String>, SyncError>) -> Vec<Effect> {
        self.code_in_flight = false;
        let mut effects = Vec::new();
        match result {
            Ok(Some(code)) => {
                if !self.state.needs_pairing_code() {
                    tracing::debug!(state = %self.state, "Discarding pairing code for superseded state");
                    return effects;
                }
                if let Some(next) = self.state.with_code(code) {
                    self.apply(next, &mut effects);
                }
            }
            Ok(None) => tracing::debug!("Backend had no pairing code"),
            Err(e) => tracing::warn!("Pairing code fetch failed: {}", e),
        }
        effects
    }

    fn on_channel_opened(&mut self) -> Vec<Effect> {
        if self.channel != ChannelPhase::Connecting {
            return Vec::new();
        }
        self.channel = ChannelPhase::Open;

        let mut effects = Vec::new();
        if self.mode != TransportMode::Poll {
            self.mode = TransportMode::Push;
        }
        self.arm_stall_timer(&mut effects);
        effects
    }

    fn on_channel_message(&mut self, text: &str) -> Vec<Effect> {
        if self.channel != ChannelPhase::Open {
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.arm_stall_timer(&mut effects);

        let update = match StatusFrame::decode(text) {
            Ok(Some(update)) => update,
            Ok(None) => return effects,
            Err(e) => {
                tracing::warn!("Dropping malformed status frame: {}", e);
                return effects;
            }
        };

        if !self.push_confirmed {
            self.push_confirmed = true;
            self.epoch += 1;
        }
        if self.mode == TransportMode::Poll {
            effects.push(Effect::StopPolling);
        }
        self.mode = TransportMode::Push;

        let merged = self.state.merge(update.into());
        self.apply(merged, &mut effects);
        effects
    }

    fn on_channel_ended(&mut self) -> Vec<Effect> {
        if self.channel == ChannelPhase::Idle {
            return Vec::new();
        }
        self.channel = ChannelPhase::Idle;
        self.fall_back_to_poll()
    }

    fn on_push_stalled(&mut self) -> Vec<Effect> {
        match self.channel {
            ChannelPhase::Idle => return Vec::new(),
            ChannelPhase::Connecting => {
                tracing::warn!("Status channel handshake stalled, falling back to polling")
            }
            ChannelPhase::Open => {
                tracing::warn!("Status channel silent, falling back to polling")
            }
        }
        self.channel = ChannelPhase::Idle;
        self.fall_back_to_poll()
    }

    fn fall_back_to_poll(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CloseChannel];
        self.push_confirmed = false;
        if self.mode != TransportMode::Poll {
            self.mode = TransportMode::Poll;
            effects.push(Effect::StartPolling);
        }
        effects.push(Effect::ScheduleReopen);
        effects
    }

    fn on_reopen(&mut self) -> Vec<Effect> {
        if self.channel != ChannelPhase::Idle {
            return Vec::new();
        }
        tracing::debug!("Reopening status channel");
        self.channel = ChannelPhase::Connecting;
        let mut effects = vec![Effect::OpenChannel];
        self.arm_stall_timer(&mut effects);
        effects
    }

    fn on_poll_tick(&mut self) -> Vec<Effect> {
        if self.mode != TransportMode::Poll || self.poll_in_flight {
            return Vec::new();
        }
        self.poll_in_flight = true;
        vec![Effect::FetchStatus {
            origin: FetchOrigin::Poll,
            epoch: self.epoch,
        }]
    }

    /// The timer also bounds the handshake, so it is armed on open as well
    fn arm_stall_timer(&self, effects: &mut Vec<Effect>) {
        if self.stall_detection {
            effects.push(Effect::ArmStallTimer);
        }
    }

    fn request_code_if_needed(&mut self, effects: &mut Vec<Effect>) {
        if self.state.needs_pairing_code() && !self.code_in_flight {
            self.code_in_flight = true;
            effects.push(Effect::FetchPairingCode);
        }
    }

    fn apply(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if next != self.state {
            self.state = next;
            effects.push(Effect::Publish(self.state.clone()));
        }
    }
}
