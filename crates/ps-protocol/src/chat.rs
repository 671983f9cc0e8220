//! Chat payloads
//!
//! # Message Flow
//!
//! Typical frame sequence for one turn on the chat push channel:
//!
//! 1. Client sends a [`ChatRequest`] (`{message, history?}`)
//! 2. Server sends zero or more `{"type":"chunk","content":...}` frames
//! 3. Server finishes with `{"type":"end"}` or `{"type":"error","message":...}`
//!
//! The same [`ChatRequest`] body is accepted by the non-streaming chat
//! endpoint, which answers with a [`ChatResponse`].

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of a conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Outbound chat payload, one per turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, history: &[Message]) -> Self {
        Self {
            message: message.into(),
            history: history.to_vec(),
        }
    }

    /// Serialize to the JSON text sent over the chat channel
    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response of the non-streaming chat endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

fn default_success() -> bool {
    true
}

/// Inbound frame on the chat push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    /// Partial reply text
    Chunk { content: String },
    /// Reply finished
    End,
    /// Reply failed
    Error { message: String },
}

impl ChatFrame {
    /// Decode a chat frame from JSON text
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("chunk" | "end" | "error") => Ok(serde_json::from_value(value)?),
            Some(other) => Err(DecodeError::UnknownFrameType(other.to_string())),
            None => Err(DecodeError::MissingFrameType),
        }
    }

    /// Encode as JSON text
    pub fn encode(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this frame ends the turn
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatFrame::Chunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_frame_decode() {
        assert_eq!(
            ChatFrame::decode(r#"{"type":"chunk","content":"Hel"}"#).unwrap(),
            ChatFrame::Chunk {
                content: "Hel".to_string()
            }
        );
        assert_eq!(ChatFrame::decode(r#"{"type":"end"}"#).unwrap(), ChatFrame::End);
        assert_eq!(
            ChatFrame::decode(r#"{"type":"error","message":"boom"}"#).unwrap(),
            ChatFrame::Error {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_chat_frame_decode_errors() {
        assert!(matches!(
            ChatFrame::decode(r#"{"error":"Empty message"}"#),
            Err(DecodeError::MissingFrameType)
        ));
        assert!(matches!(
            ChatFrame::decode(r#"{"type":"thinking"}"#),
            Err(DecodeError::UnknownFrameType(t)) if t == "thinking"
        ));
        assert!(matches!(
            ChatFrame::decode(r#"{"type":"chunk"}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(ChatFrame::decode("{"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_chat_frame_terminal() {
        assert!(!ChatFrame::Chunk {
            content: String::new()
        }
        .is_terminal());
        assert!(ChatFrame::End.is_terminal());
        assert!(ChatFrame::Error {
            message: "x".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_chat_request_omits_empty_history() {
        let req = ChatRequest::new("hi", &[]);
        assert_eq!(req.to_json().unwrap(), r#"{"message":"hi"}"#);

        let req = ChatRequest::new("again", &[Message::user("hi"), Message::assistant("hello")]);
        let json = req.to_json().unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#""role":"assistant""#));
    }

    #[test]
    fn test_chat_response_defaults() {
        let resp: ChatResponse = serde_json::from_str(r#"{"response":"ok"}"#).unwrap();
        assert!(resp.success);
        assert!(resp.tool_calls.is_none());
    }
}
