//! Reply assembly
//!
//! [`ReplyAssembler`] applies chat channel frames to the active turn's
//! [`ReplyStream`]. Frames tagged with any other turn are dropped, and a
//! terminal stream ignores everything that follows.

use ps_core::ReplyStream;
use ps_protocol::ChatFrame;

/// Identifies one conversation turn on a consumer
pub type TurnId = u64;

/// Progress of a turn, as delivered to its [`TurnHandle`](super::TurnHandle)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Next piece of reply text
    Fragment(String),
    /// Reply finished; carries the full text
    Completed(String),
    /// Reply failed; carries the reason
    Failed(String),
}

impl ReplyEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyEvent::Fragment(_))
    }
}

pub(crate) const SUPERSEDED: &str = "Superseded by a newer turn";
pub(crate) const CLOSED_EARLY: &str = "Chat channel closed before the reply completed";

/// Pure core of the reply stream consumer
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    active: Option<TurnId>,
    stream: ReplyStream,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `turn` the active turn with an empty stream.
    ///
    /// Returns the events closing out the previous turn if it was still
    /// pending.
    pub fn begin(&mut self, turn: TurnId) -> Vec<ReplyEvent> {
        let mut events = Vec::new();
        if self.active.is_some() && self.stream.fail(SUPERSEDED) {
            events.push(ReplyEvent::Failed(SUPERSEDED.to_string()));
        }
        self.active = Some(turn);
        self.stream = ReplyStream::new();
        events
    }

    /// Apply one raw frame received for `turn`
    pub fn on_frame(&mut self, turn: TurnId, text: &str) -> Vec<ReplyEvent> {
        if !self.is_active(turn) {
            tracing::debug!(turn, "Dropping frame for inactive turn");
            return Vec::new();
        }

        let frame = match ChatFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(turn, "Dropping malformed chat frame: {}", e);
                return Vec::new();
            }
        };

        match frame {
            ChatFrame::Chunk { content } => {
                if self.stream.push_fragment(content.clone()) {
                    return vec![ReplyEvent::Fragment(content)];
                }
            }
            ChatFrame::End => {
                if self.stream.complete() {
                    return vec![ReplyEvent::Completed(self.stream.text())];
                }
            }
            ChatFrame::Error { message } => {
                if self.stream.fail(message.clone()) {
                    return vec![ReplyEvent::Failed(message)];
                }
            }
        }
        tracing::trace!(turn, "Ignoring frame after turn ended");
        Vec::new()
    }

    /// The channel carrying `turn` reported an error
    pub fn on_channel_error(&mut self, turn: TurnId, reason: &str) -> Vec<ReplyEvent> {
        if self.is_active(turn) && self.stream.fail(reason) {
            return vec![ReplyEvent::Failed(reason.to_string())];
        }
        Vec::new()
    }

    /// The channel carrying `turn` closed
    pub fn on_channel_closed(&mut self, turn: TurnId) -> Vec<ReplyEvent> {
        self.on_channel_error(turn, CLOSED_EARLY)
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.active
    }

    /// Stream of the active turn
    pub fn stream(&self) -> &ReplyStream {
        &self.stream
    }

    fn is_active(&self, turn: TurnId) -> bool {
        self.active == Some(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_core::TurnState;

    fn chunk(content: &str) -> String {
        ChatFrame::Chunk {
            content: content.to_string(),
        }
        .encode()
        .unwrap()
    }

    const END: &str = r#"{"type":"end"}"#;

    #[test]
    fn test_chunks_then_end() {
        let mut assembler = ReplyAssembler::new();
        assert!(assembler.begin(1).is_empty());

        assert_eq!(
            assembler.on_frame(1, &chunk("Hel")),
            vec![ReplyEvent::Fragment("Hel".into())]
        );
        assert_eq!(
            assembler.on_frame(1, &chunk("lo")),
            vec![ReplyEvent::Fragment("lo".into())]
        );
        assert_eq!(
            assembler.on_frame(1, END),
            vec![ReplyEvent::Completed("Hello".into())]
        );

        assert_eq!(assembler.stream().fragments(), ["Hel", "lo"]);
        assert_eq!(assembler.stream().state(), TurnState::Completed);
    }

    #[test]
    fn test_fragments_kept_byte_exact() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        for piece in [" ", "héllo", "", "\n", " wörld "] {
            assembler.on_frame(1, &chunk(piece));
        }
        assert_eq!(assembler.stream().text(), " héllo\n wörld ");
        assert_eq!(assembler.stream().fragments().len(), 5);
    }

    #[test]
    fn test_terminal_stream_ignores_later_frames() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        assembler.on_frame(1, r#"{"type":"error","message":"model offline"}"#);

        assert!(assembler.on_frame(1, &chunk("late")).is_empty());
        assert!(assembler.on_frame(1, END).is_empty());
        assert!(assembler.on_channel_closed(1).is_empty());

        assert_eq!(assembler.stream().state(), TurnState::Failed);
        assert_eq!(assembler.stream().error(), Some("model offline"));
        assert!(assembler.stream().fragments().is_empty());
    }

    #[test]
    fn test_malformed_frames_leave_stream_untouched() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        assembler.on_frame(1, &chunk("a"));

        assert!(assembler.on_frame(1, "{oops").is_empty());
        assert!(assembler.on_frame(1, r#"{"error":"Empty message"}"#).is_empty());
        assert!(assembler.on_frame(1, r#"{"type":"tool_call"}"#).is_empty());

        assert_eq!(assembler.stream().state(), TurnState::Pending);
        assert_eq!(assembler.stream().fragments(), ["a"]);
    }

    #[test]
    fn test_new_turn_discards_stale_frames() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        assembler.on_frame(1, &chunk("old"));

        assert_eq!(
            assembler.begin(2),
            vec![ReplyEvent::Failed(SUPERSEDED.into())]
        );
        assert!(assembler.on_frame(1, &chunk("stale")).is_empty());
        assembler.on_frame(2, &chunk("new"));

        assert_eq!(assembler.stream().fragments(), ["new"]);
    }

    #[test]
    fn test_begin_after_completed_turn_emits_nothing() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        assembler.on_frame(1, END);
        assert!(assembler.begin(2).is_empty());
        assert_eq!(assembler.active_turn(), Some(2));
    }

    #[test]
    fn test_channel_failure_fails_pending_turn_once() {
        let mut assembler = ReplyAssembler::new();
        assembler.begin(1);
        assert_eq!(
            assembler.on_channel_error(1, "reset by peer"),
            vec![ReplyEvent::Failed("reset by peer".into())]
        );
        assert!(assembler.on_channel_closed(1).is_empty());
        // Errors for other turns are ignored
        assert!(assembler.on_channel_error(7, "x").is_empty());
    }
}
