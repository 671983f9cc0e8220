//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use ps_protocol::StatusUpdate;

pub use ps_protocol::{Message, Role};

/// Pairing/connection state of a session, as last applied by the synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Backend is starting up or reconnecting to the messaging network
    Initializing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Waiting for the user to scan the pairing code.
    ///
    /// The code may arrive after the state tag itself.
    AwaitingPairing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code_payload: Option<String>,
    },
    /// Device is paired
    Paired,
    /// Backend unreachable or reported an error
    Error { message: String },
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Initializing { detail: None }
    }
}

impl ConnectionState {
    /// Bare state tag
    pub fn status(&self) -> PairingStatus {
        match self {
            ConnectionState::Initializing { .. } => PairingStatus::Initializing,
            ConnectionState::AwaitingPairing { .. } => PairingStatus::AwaitingPairing,
            ConnectionState::Paired => PairingStatus::Paired,
            ConnectionState::Error { .. } => PairingStatus::Error,
        }
    }

    /// Pairing code, if one has been received
    pub fn code_payload(&self) -> Option<&str> {
        match self {
            ConnectionState::AwaitingPairing { code_payload } => code_payload.as_deref(),
            _ => None,
        }
    }

    /// Whether the state is `awaiting_pairing` with no code received yet
    pub fn needs_pairing_code(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingPairing { code_payload: None }
        )
    }

    /// Whether the device is paired
    pub fn is_paired(&self) -> bool {
        matches!(self, ConnectionState::Paired)
    }

    /// Apply a later update on top of this state.
    ///
    /// The update replaces the current state, except that an
    /// `awaiting_pairing` update without a code keeps the code already held
    /// for the same tag.
    pub fn merge(&self, update: ConnectionState) -> ConnectionState {
        match (self, update) {
            (
                ConnectionState::AwaitingPairing {
                    code_payload: Some(code),
                },
                ConnectionState::AwaitingPairing { code_payload: None },
            ) => ConnectionState::AwaitingPairing {
                code_payload: Some(code.clone()),
            },
            (_, update) => update,
        }
    }

    /// Attach a separately fetched pairing code.
    ///
    /// Returns `None` when the state is no longer `awaiting_pairing`.
    pub fn with_code(&self, code: String) -> Option<ConnectionState> {
        match self {
            ConnectionState::AwaitingPairing { .. } => Some(ConnectionState::AwaitingPairing {
                code_payload: Some(code),
            }),
            _ => None,
        }
    }

    /// Error state with the given message
    pub fn error(message: impl Into<String>) -> Self {
        ConnectionState::Error {
            message: message.into(),
        }
    }
}

impl From<StatusUpdate> for ConnectionState {
    fn from(update: StatusUpdate) -> Self {
        match update.status.as_str() {
            "qr_ready" | "awaiting_pairing" => ConnectionState::AwaitingPairing {
                code_payload: update.code_payload,
            },
            "connected" | "paired" => ConnectionState::Paired,
            "error" => ConnectionState::Error {
                message: update
                    .message
                    .unwrap_or_else(|| "Backend reported an error".to_string()),
            },
            _ => ConnectionState::Initializing {
                detail: update.message,
            },
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Initializing { detail: Some(d) } => write!(f, "initializing ({})", d),
            ConnectionState::Initializing { detail: None } => write!(f, "initializing"),
            ConnectionState::AwaitingPairing { code_payload: Some(_) } => {
                write!(f, "awaiting pairing (code ready)")
            }
            ConnectionState::AwaitingPairing { code_payload: None } => {
                write!(f, "awaiting pairing")
            }
            ConnectionState::Paired => write!(f, "paired"),
            ConnectionState::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Tag of a [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Initializing,
    AwaitingPairing,
    Paired,
    Error,
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingStatus::Initializing => write!(f, "initializing"),
            PairingStatus::AwaitingPairing => write!(f, "awaiting_pairing"),
            PairingStatus::Paired => write!(f, "paired"),
            PairingStatus::Error => write!(f, "error"),
        }
    }
}

/// Which transport currently feeds status updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Server-initiated updates over the status channel
    Push,
    /// Timed request/response polling
    Poll,
    /// Neither transport active
    #[default]
    None,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Push => write!(f, "push"),
            TransportMode::Poll => write!(f, "poll"),
            TransportMode::None => write!(f, "none"),
        }
    }
}

/// Terminal flag of a [`ReplyStream`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// One outstanding assistant reply, assembled from streamed fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyStream {
    fragments: Vec<String>,
    state: TurnState,
    error: Option<String>,
}

impl ReplyStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns false if the stream is already terminal.
    pub fn push_fragment(&mut self, fragment: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.fragments.push(fragment.into());
        true
    }

    /// Mark the stream completed. Returns false if already terminal.
    pub fn complete(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = TurnState::Completed;
        true
    }

    /// Mark the stream failed. Returns false if already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = TurnState::Failed;
        self.error = Some(message.into());
        true
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Concatenation of all fragments in arrival order
    pub fn text(&self) -> String {
        self.fragments.concat()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TurnState::Pending
    }
}

/// Append-only conversation history
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Record a completed turn (user message followed by the assistant reply)
    pub fn record_turn(&mut self, user: impl Into<String>, reply: impl Into<String>) {
        self.messages.push(Message::user(user));
        self.messages.push(Message::assistant(reply));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting(code: Option<&str>) -> ConnectionState {
        ConnectionState::AwaitingPairing {
            code_payload: code.map(String::from),
        }
    }

    #[test]
    fn test_merge_keeps_code_for_bare_update() {
        let current = awaiting(Some("X"));
        let merged = current.merge(awaiting(None));
        assert_eq!(merged, awaiting(Some("X")));

        // Repeated bare updates keep preserving it
        let merged = merged.merge(awaiting(None)).merge(awaiting(None));
        assert_eq!(merged.code_payload(), Some("X"));
    }

    #[test]
    fn test_merge_replaces_code_when_update_has_one() {
        let merged = awaiting(Some("X")).merge(awaiting(Some("Y")));
        assert_eq!(merged.code_payload(), Some("Y"));
    }

    #[test]
    fn test_merge_replaces_other_tags() {
        let merged = awaiting(Some("X")).merge(ConnectionState::Paired);
        assert_eq!(merged, ConnectionState::Paired);

        // Code does not survive a round trip through another tag
        let merged = merged.merge(awaiting(None));
        assert_eq!(merged, awaiting(None));
    }

    #[test]
    fn test_with_code_only_when_awaiting() {
        assert_eq!(
            awaiting(None).with_code("X".into()),
            Some(awaiting(Some("X")))
        );
        assert_eq!(ConnectionState::Paired.with_code("X".into()), None);
    }

    #[test]
    fn test_from_status_update() {
        let state: ConnectionState = StatusUpdate::new("qr_ready").with_code("Q").into();
        assert_eq!(state, awaiting(Some("Q")));

        let state: ConnectionState = StatusUpdate::new("connected").into();
        assert!(state.is_paired());

        let state: ConnectionState = StatusUpdate::new("error").with_message("bridge down").into();
        assert_eq!(state, ConnectionState::error("bridge down"));

        let state: ConnectionState = StatusUpdate::new("connecting")
            .with_message("Connecting to WhatsApp...")
            .into();
        assert_eq!(state.status(), PairingStatus::Initializing);
    }

    #[test]
    fn test_connection_state_serialization() {
        let json = serde_json::to_string(&awaiting(Some("X"))).unwrap();
        assert_eq!(json, r#"{"status":"awaiting_pairing","code_payload":"X"}"#);

        let json = serde_json::to_string(&ConnectionState::Paired).unwrap();
        assert_eq!(json, r#"{"status":"paired"}"#);
    }

    #[test]
    fn test_transport_mode_display() {
        assert_eq!(TransportMode::Push.to_string(), "push");
        assert_eq!(TransportMode::Poll.to_string(), "poll");
        assert_eq!(TransportMode::default().to_string(), "none");
    }

    #[test]
    fn test_reply_stream_terminal_is_idempotent() {
        let mut stream = ReplyStream::new();
        assert!(stream.push_fragment("Hel"));
        assert!(stream.push_fragment("lo"));
        assert!(stream.complete());

        assert!(!stream.push_fragment("!"));
        assert!(!stream.fail("late"));
        assert!(!stream.complete());

        assert_eq!(stream.fragments(), ["Hel", "lo"]);
        assert_eq!(stream.text(), "Hello");
        assert_eq!(stream.state(), TurnState::Completed);
        assert!(stream.error().is_none());
    }

    #[test]
    fn test_reply_stream_failure_keeps_fragments() {
        let mut stream = ReplyStream::new();
        stream.push_fragment("partial");
        assert!(stream.fail("upstream error"));
        assert_eq!(stream.state(), TurnState::Failed);
        assert_eq!(stream.error(), Some("upstream error"));
        assert_eq!(stream.text(), "partial");
    }

    #[test]
    fn test_conversation_record_turn() {
        let mut convo = Conversation::new();
        convo.record_turn("hi", "hello");
        assert_eq!(convo.len(), 2);
        assert_eq!(convo.messages()[0], Message::user("hi"));
        assert_eq!(convo.messages()[1].role, Role::Assistant);
    }
}
