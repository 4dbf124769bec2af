//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Request acknowledgement
    Ack {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Streaming
    Chunk {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<String>,
        #[serde(default)]
        chunk_index: u64,
        #[serde(default)]
        delta: String,
        /// Cumulative content so far; the server is authoritative for it.
        full_content: String,
    },
    Complete {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default)]
        response: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured_analysis: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageMetrics>,
    },
    ToolError {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        validation_errors: Vec<ValidationError>,
    },
    /// Connection-level error. Without a conversation id it applies to every
    /// conversation on the connection.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<String>,
        message: String,
    },

    // Multi-character sessions
    MultiCharacterStart {
        conversation_id: String,
        session_id: String,
        mode: MultiCharacterMode,
        characters: Vec<String>,
    },
    CharacterTurn {
        conversation_id: String,
        character_id: String,
    },
    Processing {
        conversation_id: String,
        character_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<String>,
    },
    StreamingComplete {
        conversation_id: String,
        character_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageMetrics>,
    },
    MultiCharacterComplete {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round_number: Option<u32>,
    },
}

impl ServerMessage {
    /// Routing kind, or `None` for messages that are not conversation events
    pub fn event_kind(&self) -> Option<EventKind> {
        Some(match self {
            ServerMessage::Ack { .. } => return None,
            ServerMessage::Chunk { .. } => EventKind::Chunk,
            ServerMessage::Complete { .. } => EventKind::Complete,
            ServerMessage::ToolError { .. } => EventKind::ToolError,
            ServerMessage::Error { .. } => EventKind::Error,
            ServerMessage::MultiCharacterStart { .. } => EventKind::MultiCharacterStart,
            ServerMessage::CharacterTurn { .. } => EventKind::CharacterTurn,
            ServerMessage::Processing { .. } => EventKind::Processing,
            ServerMessage::StreamingComplete { .. } => EventKind::StreamingComplete,
            ServerMessage::MultiCharacterComplete { .. } => EventKind::MultiCharacterComplete,
        })
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Ack {
                conversation_id, ..
            }
            | ServerMessage::Error {
                conversation_id, ..
            } => conversation_id.as_deref(),
            ServerMessage::Chunk {
                conversation_id, ..
            }
            | ServerMessage::Complete {
                conversation_id, ..
            }
            | ServerMessage::ToolError {
                conversation_id, ..
            }
            | ServerMessage::MultiCharacterStart {
                conversation_id, ..
            }
            | ServerMessage::CharacterTurn {
                conversation_id, ..
            }
            | ServerMessage::Processing {
                conversation_id, ..
            }
            | ServerMessage::StreamingComplete {
                conversation_id, ..
            }
            | ServerMessage::MultiCharacterComplete {
                conversation_id, ..
            } => Some(conversation_id.as_str()),
        }
    }

    /// Tool the event belongs to, when the server scoped it to one
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            ServerMessage::Chunk { tool_name, .. }
            | ServerMessage::Complete { tool_name, .. }
            | ServerMessage::ToolError { tool_name, .. } => tool_name.as_deref(),
            _ => None,
        }
    }

    pub fn character_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Chunk { character_id, .. }
            | ServerMessage::Complete { character_id, .. }
            | ServerMessage::Error { character_id, .. } => character_id.as_deref(),
            ServerMessage::CharacterTurn { character_id, .. }
            | ServerMessage::Processing { character_id, .. }
            | ServerMessage::StreamingComplete { character_id, .. } => Some(character_id.as_str()),
            _ => None,
        }
    }
}
