//! Multi-character session controller
//!
//! Several characters respond within one conversation under a turn-taking
//! mode. Session state is folded from the server's multi-character events
//! by [`apply_event`]; the controller adds conversation management and the
//! outbound operations on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use colloquy_protocol::{
    CharacterStatus, EventKind, MultiCharacterMode, ServerMessage, UsageMetrics,
};
use serde::Serialize;
use serde_json::Map;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalog::CharacterProfile;
use crate::context::StreamingContext;
use crate::error::ClientError;
use crate::router::{EventHandler, Subscription, ToolFilter};
use crate::transport::{CreateConversation, StartMultiCharacter};

/// One character's response slot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CharacterResponse {
    pub character_id: String,
    pub status: CharacterStatus,
    pub content: String,
    pub tracking_id: Option<String>,
    pub metrics: Option<UsageMetrics>,
    pub error: Option<String>,
}

impl CharacterResponse {
    fn pending(character_id: &str) -> Self {
        Self {
            character_id: character_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MultiCharacterState {
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub mode: Option<MultiCharacterMode>,
    /// Session order
    pub characters: Vec<String>,
    pub current_character: Option<String>,
    pub round_number: u32,
    pub is_active: bool,
    pub responses: Vec<CharacterResponse>,
    /// Connection-level error; per-character errors live on the slots
    pub error: Option<String>,
}

impl MultiCharacterState {
    pub fn response(&self, character_id: &str) -> Option<&CharacterResponse> {
        self.responses.iter().find(|r| r.character_id == character_id)
    }

    fn response_mut(&mut self, character_id: &str) -> Option<&mut CharacterResponse> {
        self.responses
            .iter_mut()
            .find(|r| r.character_id == character_id)
    }

    pub fn is_any_character_streaming(&self) -> bool {
        self.responses.iter().any(|r| r.status.is_active())
    }
}

/// Fold one server event into the session state.
///
/// Returns false when the event was ignored (wrong kind, character outside
/// the session, turn notification in simultaneous mode).
pub fn apply_event(state: &mut MultiCharacterState, message: &ServerMessage) -> bool {
    match message {
        ServerMessage::MultiCharacterStart {
            session_id,
            mode,
            characters,
            ..
        } => {
            state.session_id = Some(session_id.clone());
            state.mode = Some(*mode);
            state.characters = characters.clone();
            state.responses = characters
                .iter()
                .map(|id| CharacterResponse::pending(id))
                .collect();
            state.current_character = None;
            state.is_active = true;
            state.error = None;
            true
        }

        ServerMessage::CharacterTurn { character_id, .. } => {
            let takes_turns = state.mode.is_some_and(|mode| mode.has_turns());
            if !takes_turns || !state.characters.contains(character_id) {
                return false;
            }
            state.current_character = Some(character_id.clone());
            true
        }

        ServerMessage::Processing {
            character_id,
            tracking_id,
            ..
        } => match state.response_mut(character_id) {
            Some(slot) => {
                slot.status = CharacterStatus::Processing;
                slot.content.clear();
                slot.error = None;
                slot.metrics = None;
                if tracking_id.is_some() {
                    slot.tracking_id = tracking_id.clone();
                }
                true
            }
            None => false,
        },

        ServerMessage::Chunk {
            character_id: Some(character_id),
            full_content,
            tracking_id,
            ..
        } => match state.response_mut(character_id) {
            Some(slot) => {
                slot.status = CharacterStatus::Streaming;
                slot.content = full_content.clone();
                if tracking_id.is_some() {
                    slot.tracking_id = tracking_id.clone();
                }
                true
            }
            None => false,
        },

        ServerMessage::StreamingComplete {
            character_id,
            content,
            usage,
            ..
        } => match state.response_mut(character_id) {
            Some(slot) => {
                slot.status = CharacterStatus::Complete;
                if let Some(content) = content {
                    slot.content = content.clone();
                }
                slot.metrics = usage.clone();
                true
            }
            None => false,
        },

        ServerMessage::Error {
            character_id: Some(character_id),
            message,
            ..
        } => match state.response_mut(character_id) {
            Some(slot) => {
                slot.status = CharacterStatus::Error;
                slot.error = Some(message.clone());
                true
            }
            None => false,
        },

        ServerMessage::Error { message, .. } => {
            state.error = Some(message.clone());
            true
        }

        ServerMessage::MultiCharacterComplete { round_number, .. } => {
            state.is_active = false;
            state.current_character = None;
            state.round_number = round_number.unwrap_or(state.round_number + 1);
            true
        }

        _ => false,
    }
}

/// A response slot joined with its catalog profile
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterEntry {
    pub profile: CharacterProfile,
    pub response: CharacterResponse,
}

struct Inner {
    ctx: StreamingContext,
    panel_id: String,
    /// Owner of the conversation when one has to be created
    character_id: String,
    state: watch::Sender<MultiCharacterState>,
    subscriptions: Mutex<Vec<Subscription>>,
    creating: tokio::sync::Mutex<()>,
    retained: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if *self.retained.get_mut() {
            self.ctx.panels.release_panel(&self.panel_id);
        }
    }
}

/// Handle to a multi-character session controller (cheap to Clone).
#[derive(Clone)]
pub struct MultiCharacterController {
    inner: Arc<Inner>,
}

impl MultiCharacterController {
    pub fn new(
        ctx: StreamingContext,
        panel_id: impl Into<String>,
        character_id: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(MultiCharacterState::default());
        Self {
            inner: Arc::new(Inner {
                ctx,
                panel_id: panel_id.into(),
                character_id: character_id.into(),
                state,
                subscriptions: Mutex::new(Vec::new()),
                creating: tokio::sync::Mutex::new(()),
                retained: AtomicBool::new(false),
            }),
        }
    }

    pub fn snapshot(&self) -> MultiCharacterState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MultiCharacterState> {
        self.inner.state.subscribe()
    }

    pub fn get_character_response(&self, character_id: &str) -> Option<CharacterResponse> {
        self.inner.state.borrow().response(character_id).cloned()
    }

    /// Every slot in session order, joined with catalog metadata.
    pub fn get_all_responses(&self) -> Vec<CharacterEntry> {
        let state = self.inner.state.borrow();
        state
            .responses
            .iter()
            .map(|response| CharacterEntry {
                profile: self
                    .inner
                    .ctx
                    .catalog
                    .get(&response.character_id)
                    .unwrap_or_else(|| CharacterProfile::unknown(&response.character_id)),
                response: response.clone(),
            })
            .collect()
    }

    pub fn is_any_character_streaming(&self) -> bool {
        self.inner.state.borrow().is_any_character_streaming()
    }

    /// Ask the server to run `characters` over `content` in `mode`.
    pub async fn start_session(
        &self,
        characters: Vec<String>,
        mode: MultiCharacterMode,
        content: &str,
    ) -> Result<String, ClientError> {
        if self.is_any_character_streaming() {
            // The running session keeps its state; only the caller hears.
            let error = ClientError::SessionInProgress;
            warn!(
                component = "multi_character",
                event = "session.rejected",
                panel_id = %self.inner.panel_id,
                error = %error,
            );
            return Err(error);
        }
        if !self.inner.ctx.is_connected() {
            return Err(self.fail(ClientError::NotConnected));
        }

        let conversation_id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e)),
        };

        self.inner.state.send_modify(|state| state.error = None);

        info!(
            component = "multi_character",
            event = "session.start",
            panel_id = %self.inner.panel_id,
            conversation_id = %conversation_id,
            mode = mode.as_str(),
            characters = characters.len(),
            "Starting multi-character session"
        );

        let request = StartMultiCharacter {
            conversation_id: conversation_id.clone(),
            characters,
            mode,
            content: content.to_string(),
        };
        match self.inner.ctx.transport.start_multi_character(request).await {
            Ok(_) => Ok(conversation_id),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Run another round with the current characters and mode.
    pub async fn send_message(&self, content: &str) -> Result<String, ClientError> {
        let session = {
            let state = self.inner.state.borrow();
            match (state.conversation_id.is_some(), state.mode) {
                (true, Some(mode)) if !state.characters.is_empty() => {
                    Some((state.characters.clone(), mode))
                }
                _ => None,
            }
        };
        let Some((characters, mode)) = session else {
            return Err(self.fail(ClientError::NoConversation));
        };
        self.start_session(characters, mode, content).await
    }

    /// Cancel best-effort and clear the session locally. Keeps the
    /// conversation.
    pub fn reset(&self) {
        let mut cancel = None;
        self.inner.state.send_modify(|state| {
            if state.is_active || state.is_any_character_streaming() {
                cancel = state.conversation_id.clone();
            }
            *state = MultiCharacterState {
                conversation_id: state.conversation_id.take(),
                round_number: state.round_number,
                ..Default::default()
            };
        });

        if let Some(conversation_id) = cancel {
            info!(
                component = "multi_character",
                event = "session.cancel",
                panel_id = %self.inner.panel_id,
                conversation_id = %conversation_id,
            );
            self.inner.ctx.transport.cancel_request(&conversation_id);
        }
    }

    async fn ensure_conversation(&self) -> Result<String, ClientError> {
        let _creating = self.inner.creating.lock().await;
        let existing = self.inner.state.borrow().conversation_id.clone();
        if let Some(id) = existing {
            return Ok(id);
        }

        let request = CreateConversation {
            character_id: self.inner.character_id.clone(),
            panel_id: self.inner.panel_id.clone(),
            metadata: Map::new(),
        };
        let conversation_id = self
            .inner
            .ctx
            .transport
            .create_conversation(request)
            .await
            .map_err(|e| ClientError::CreationFailed(e.to_string()))?;

        self.attach(&conversation_id);
        self.inner
            .state
            .send_modify(|state| state.conversation_id = Some(conversation_id.clone()));
        if !self.inner.retained.swap(true, Ordering::SeqCst) {
            self.inner.ctx.panels.retain_panel(&self.inner.panel_id);
        }
        self.inner
            .ctx
            .panels
            .join_panel(&self.inner.panel_id, &conversation_id)
            .await;
        Ok(conversation_id)
    }

    fn attach(&self, conversation_id: &str) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: EventHandler = Arc::new(move |message: &ServerMessage| {
            if let Some(inner) = weak.upgrade() {
                MultiCharacterController { inner }.handle_event(message);
            }
        });

        let subscriptions = self.inner.ctx.router.on_conversation_events(
            conversation_id,
            &EventKind::MULTI_CHARACTER,
            ToolFilter::Any,
            handler,
        );
        let previous = std::mem::replace(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            subscriptions,
        );
        drop(previous);
    }

    fn handle_event(&self, message: &ServerMessage) {
        let applied = self
            .inner
            .state
            .send_if_modified(|state| apply_event(state, message));

        if !applied {
            debug!(
                component = "multi_character",
                event = "session.event_dropped",
                panel_id = %self.inner.panel_id,
                kind = ?message.event_kind(),
                character_id = ?message.character_id(),
            );
        }
    }

    fn fail(&self, error: ClientError) -> ClientError {
        warn!(
            component = "multi_character",
            event = "session.failed",
            panel_id = %self.inner.panel_id,
            error = %error,
        );
        let message = error.to_string();
        self.inner
            .state
            .send_modify(|state| state.error = Some(message));
        error
    }
}
