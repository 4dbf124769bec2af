//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::MultiCharacterMode;

/// Messages sent from client to server
///
/// Requests carrying a `request_id` are answered with a
/// [`ServerMessage::Ack`](crate::ServerMessage::Ack) once the server accepts
/// them; results arrive later as conversation events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Conversation lifecycle
    CreateConversation {
        request_id: String,
        character_id: String,
        panel_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },

    // Actions
    InvokeTool {
        request_id: String,
        conversation_id: String,
        character_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
    SendMessage {
        request_id: String,
        conversation_id: String,
        character_id: String,
        content: String,
    },
    StartMultiCharacter {
        request_id: String,
        conversation_id: String,
        characters: Vec<String>,
        mode: MultiCharacterMode,
        content: String,
    },
    CancelRequest {
        conversation_id: String,
    },

    // Panel routing
    JoinPanel {
        request_id: String,
        panel_id: String,
        conversation_id: String,
    },
    LeavePanel {
        panel_id: String,
    },
}

impl ClientMessage {
    /// Correlation id for requests that expect an ack
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::CreateConversation { request_id, .. }
            | ClientMessage::InvokeTool { request_id, .. }
            | ClientMessage::SendMessage { request_id, .. }
            | ClientMessage::StartMultiCharacter { request_id, .. }
            | ClientMessage::JoinPanel { request_id, .. } => Some(request_id),
            ClientMessage::CancelRequest { .. } | ClientMessage::LeavePanel { .. } => None,
        }
    }
}
