//! In-memory transport double that records every call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use colloquy_protocol::ServerMessage;
use serde_json::json;
use tokio::sync::oneshot;

use crate::catalog::{CharacterProfile, StaticCharacterCatalog};
use crate::context::StreamingContext;
use crate::error::TransportError;
use crate::router::ConversationEventRouter;
use crate::transport::{
    CreateConversation, InvokeTool, RequestAccepted, SendMessage, StartMultiCharacter, Transport,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    CreateConversation(CreateConversation),
    InvokeTool(InvokeTool),
    SendMessage(SendMessage),
    StartMultiCharacter(StartMultiCharacter),
    Cancel(String),
    JoinPanel {
        panel_id: String,
        conversation_id: String,
    },
    LeavePanel(String),
}

pub struct RecordingTransport {
    connected: AtomicBool,
    calls: Mutex<Vec<TransportCall>>,
    next_conversation: AtomicU64,
    next_tracking: AtomicU64,
    fail_next_create: Mutex<Option<TransportError>>,
    create_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            next_conversation: AtomicU64::new(1),
            next_tracking: AtomicU64::new(1),
            fail_next_create: Mutex::new(None),
            create_gate: Mutex::new(None),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self, error: TransportError) {
        *self.fail_next_create.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Park the next `create_conversation` (after it is recorded) until the
    /// returned sender fires or is dropped.
    pub fn hold_next_create(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.create_gate.lock().unwrap() = Some(gate);
        release
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::CreateConversation(_)))
    }

    pub fn invokes(&self) -> Vec<InvokeTool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::InvokeTool(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn accepted(&self) -> RequestAccepted {
        let n = self.next_tracking.fetch_add(1, Ordering::SeqCst);
        RequestAccepted {
            tracking_id: Some(format!("track-{n}")),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_conversation(
        &self,
        request: CreateConversation,
    ) -> Result<String, TransportError> {
        self.ensure_connected()?;
        self.record(TransportCall::CreateConversation(request));
        let gate = self.create_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = self.fail_next_create.lock().unwrap().take() {
            return Err(error);
        }
        let n = self.next_conversation.fetch_add(1, Ordering::SeqCst);
        Ok(format!("conv-{n}"))
    }

    async fn invoke_tool(&self, request: InvokeTool) -> Result<RequestAccepted, TransportError> {
        self.ensure_connected()?;
        self.record(TransportCall::InvokeTool(request));
        Ok(self.accepted())
    }

    async fn send_message(&self, request: SendMessage) -> Result<RequestAccepted, TransportError> {
        self.ensure_connected()?;
        self.record(TransportCall::SendMessage(request));
        Ok(self.accepted())
    }

    async fn start_multi_character(
        &self,
        request: StartMultiCharacter,
    ) -> Result<RequestAccepted, TransportError> {
        self.ensure_connected()?;
        self.record(TransportCall::StartMultiCharacter(request));
        Ok(self.accepted())
    }

    fn cancel_request(&self, conversation_id: &str) {
        self.record(TransportCall::Cancel(conversation_id.to_string()));
    }

    async fn join_panel(
        &self,
        panel_id: &str,
        conversation_id: &str,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(TransportCall::JoinPanel {
            panel_id: panel_id.to_string(),
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    fn leave_panel(&self, panel_id: &str) {
        self.record(TransportCall::LeavePanel(panel_id.to_string()));
    }
}

pub fn test_catalog() -> Arc<StaticCharacterCatalog> {
    Arc::new(StaticCharacterCatalog::new(vec![
        CharacterProfile::new("analyst", "Ana the Analyst"),
        CharacterProfile::new("writer", "Wes the Writer"),
        CharacterProfile::new("moderator", "Mo the Moderator"),
    ]))
}

pub fn test_context() -> (StreamingContext, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let ctx = StreamingContext::new(
        transport.clone(),
        ConversationEventRouter::new(),
        test_catalog(),
    );
    (ctx, transport)
}

pub fn chunk(conversation_id: &str, tool: &str, index: u64, full: &str) -> ServerMessage {
    ServerMessage::Chunk {
        conversation_id: conversation_id.into(),
        character_id: None,
        tool_name: Some(tool.into()),
        tracking_id: None,
        chunk_index: index,
        delta: String::new(),
        full_content: full.into(),
    }
}

pub fn complete(conversation_id: &str, tool: &str) -> ServerMessage {
    ServerMessage::Complete {
        conversation_id: conversation_id.into(),
        character_id: None,
        tool_name: Some(tool.into()),
        tracking_id: None,
        message_id: Some("msg-1".into()),
        response: json!({"text": "done"}),
        structured_analysis: Some(json!({
            "score": 82,
            "strengths": ["specific number"],
            "weaknesses": ["vague audience"],
            "improvements": ["name the audience"],
            "debug_trace": "internal"
        })),
        usage: Some(colloquy_protocol::UsageMetrics {
            input_tokens: 100,
            output_tokens: 40,
            total_tokens: 140,
            cost: Some(0.0021),
            duration_ms: Some(850),
        }),
    }
}
