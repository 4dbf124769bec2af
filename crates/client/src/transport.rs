//! Transport session seam.
//!
//! The physical duplex connection is an external collaborator. The
//! controllers only see this trait: requests go out through it and inbound
//! events are pushed by the implementation into a
//! [`ConversationEventRouter`](crate::router::ConversationEventRouter).

use async_trait::async_trait;
use colloquy_protocol::MultiCharacterMode;
use serde_json::{Map, Value};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateConversation {
    pub character_id: String,
    pub panel_id: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeTool {
    pub conversation_id: String,
    pub character_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub conversation_id: String,
    pub character_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMultiCharacter {
    pub conversation_id: String,
    pub characters: Vec<String>,
    pub mode: MultiCharacterMode,
    pub content: String,
}

/// Server acknowledgement that a request was accepted. The AI result itself
/// arrives later as conversation events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAccepted {
    pub tracking_id: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Returns the server-assigned conversation id.
    async fn create_conversation(
        &self,
        request: CreateConversation,
    ) -> Result<String, TransportError>;

    async fn invoke_tool(&self, request: InvokeTool) -> Result<RequestAccepted, TransportError>;

    async fn send_message(&self, request: SendMessage) -> Result<RequestAccepted, TransportError>;

    async fn start_multi_character(
        &self,
        request: StartMultiCharacter,
    ) -> Result<RequestAccepted, TransportError>;

    /// Best-effort cancel. No acknowledgement is awaited or implied.
    fn cancel_request(&self, conversation_id: &str);

    async fn join_panel(&self, panel_id: &str, conversation_id: &str)
        -> Result<(), TransportError>;

    /// Fire-and-forget; called from teardown paths.
    fn leave_panel(&self, panel_id: &str);
}
