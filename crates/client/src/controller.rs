//! Streaming invocation controller
//!
//! One controller owns one panel's conversation: it creates the conversation
//! lazily, registers conversation-scoped handlers on the router, sends tool
//! invocations and follow-ups, and folds the resulting events through the
//! pure [`transition`] function. Consumers observe state through a `watch`
//! channel or a point-in-time [`InvocationSnapshot`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use colloquy_protocol::{EventKind, ServerMessage, UsageMetrics};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::StreamingContext;
use crate::error::ClientError;
use crate::router::{EventHandler, Subscription, ToolFilter};
use crate::transition::{
    transition, AnalysisResult, Effect, Input, InvocationPhase, InvocationState,
};
use crate::transport::{CreateConversation, InvokeTool, SendMessage};

/// Maps a raw structured-analysis payload into a feature-specific shape
pub type StructuredMapper = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&AnalysisResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Mapper that keeps only `fields` of an object payload.
pub fn select_fields(fields: &'static [&'static str]) -> StructuredMapper {
    Arc::new(move |raw: &Value| match raw {
        Value::Object(map) => Value::Object(
            fields
                .iter()
                .filter_map(|field| map.get(*field).map(|v| (field.to_string(), v.clone())))
                .collect(),
        ),
        other => other.clone(),
    })
}

#[derive(Clone)]
pub struct ControllerOptions {
    pub panel_id: String,
    pub character_id: String,
    pub supported_tools: Vec<String>,
    /// Sent with `create_conversation`
    pub metadata: Map<String, Value>,
    pub structured_mapper: Option<StructuredMapper>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl ControllerOptions {
    pub fn new<I, S>(
        panel_id: impl Into<String>,
        character_id: impl Into<String>,
        supported_tools: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            panel_id: panel_id.into(),
            character_id: character_id.into(),
            supported_tools: supported_tools.into_iter().map(Into::into).collect(),
            metadata: Map::new(),
            structured_mapper: None,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn with_mapper(mut self, mapper: StructuredMapper) -> Self {
        self.structured_mapper = Some(mapper);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&AnalysisResult) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationSnapshot {
    pub conversation_id: Option<String>,
    pub is_analyzing: bool,
    pub is_streaming: bool,
    pub streaming_content: String,
    pub analysis: Option<Value>,
    pub structured_analysis: Option<Value>,
    pub error: Option<String>,
    pub metrics: Option<UsageMetrics>,
    pub message_id: Option<String>,
    pub tracking_id: Option<String>,
    pub active_tool: Option<String>,
    pub is_connected: bool,
    pub phase: &'static str,
}

impl InvocationSnapshot {
    fn new(state: &InvocationState, is_connected: bool) -> Self {
        Self {
            conversation_id: state.conversation_id.clone(),
            is_analyzing: state.phase.is_active(),
            is_streaming: matches!(state.phase, InvocationPhase::Streaming { .. }),
            streaming_content: state.streaming_content.clone(),
            analysis: state.analysis.clone(),
            structured_analysis: state.structured_analysis.clone(),
            error: state.error().map(String::from),
            metrics: state.metrics.clone(),
            message_id: state.message_id.clone(),
            tracking_id: state.tracking_id.clone(),
            active_tool: state.last_tool.clone(),
            is_connected,
            phase: state.phase.name(),
        }
    }
}

struct Inner {
    options: ControllerOptions,
    filter: ToolFilter,
    ctx: StreamingContext,
    state: watch::Sender<InvocationState>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Serializes conversation creation so concurrent invocations share one
    creating: tokio::sync::Mutex<()>,
    /// Whether this controller holds a reference on its panel
    retained: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if *self.retained.get_mut() {
            self.ctx.panels.release_panel(&self.options.panel_id);
        }
    }
}

/// Handle to a streaming invocation controller (cheap to Clone).
#[derive(Clone)]
pub struct StreamingController {
    inner: Arc<Inner>,
}

impl StreamingController {
    pub fn new(ctx: StreamingContext, options: ControllerOptions) -> Self {
        let filter = ToolFilter::only(options.supported_tools.iter().cloned());
        let (state, _) = watch::channel(InvocationState::default());
        Self {
            inner: Arc::new(Inner {
                options,
                filter,
                ctx,
                state,
                subscriptions: Mutex::new(Vec::new()),
                creating: tokio::sync::Mutex::new(()),
                retained: AtomicBool::new(false),
            }),
        }
    }

    pub fn panel_id(&self) -> &str {
        &self.inner.options.panel_id
    }

    pub fn supported_tools(&self) -> &[String] {
        &self.inner.options.supported_tools
    }

    pub fn snapshot(&self) -> InvocationSnapshot {
        InvocationSnapshot::new(&self.inner.state.borrow(), self.inner.ctx.is_connected())
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<InvocationState> {
        self.inner.state.subscribe()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.inner.state.borrow().conversation_id.clone()
    }

    // -- Operations -----------------------------------------------------------

    /// Send a tool invocation, creating the conversation on first use.
    ///
    /// Returns the conversation id once the server has accepted the request.
    /// The result streams in afterwards as events. A [`reset`] or
    /// [`clear_conversation`] while the call is in flight makes it return
    /// [`ClientError::Cancelled`] without sending anything further.
    ///
    /// [`reset`]: StreamingController::reset
    /// [`clear_conversation`]: StreamingController::clear_conversation
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, ClientError> {
        // The guard goes first: a refused call must not touch a live stream.
        let generation = self.begin(tool_name)?;

        if !self.inner.ctx.is_connected() {
            return Err(self.fail(generation, ClientError::NotConnected));
        }
        if !self.allows(tool_name) {
            return Err(self.fail(
                generation,
                ClientError::UnsupportedTool(tool_name.to_string()),
            ));
        }

        let conversation_id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
            Err(e) => return Err(self.fail(generation, e)),
        };
        self.still_current(generation, tool_name)?;

        info!(
            component = "invocation",
            event = "invocation.sent",
            panel_id = %self.inner.options.panel_id,
            conversation_id = %conversation_id,
            tool_name = %tool_name,
            "Invoking tool"
        );

        let request = InvokeTool {
            conversation_id: conversation_id.clone(),
            character_id: self.inner.options.character_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
        };
        match self.inner.ctx.transport.invoke_tool(request).await {
            Ok(accepted) => {
                self.still_current(generation, tool_name)?;
                self.apply(Input::RequestAccepted {
                    tracking_id: accepted.tracking_id,
                });
                Ok(conversation_id)
            }
            Err(e) => Err(self.fail(generation, e.into())),
        }
    }

    /// Send free text into the existing conversation.
    ///
    /// Not subject to the single-flight guard.
    pub async fn send_follow_up_message(&self, content: &str) -> Result<String, ClientError> {
        let Some(conversation_id) = self.conversation_id() else {
            return Err(self.reject(ClientError::NoConversation));
        };
        if !self.inner.ctx.is_connected() {
            return Err(self.reject(ClientError::NotConnected));
        }

        self.apply(Input::FollowUpStarted);
        let generation = self.inner.state.borrow().generation;

        let request = SendMessage {
            conversation_id: conversation_id.clone(),
            character_id: self.inner.options.character_id.clone(),
            content: content.to_string(),
        };
        match self.inner.ctx.transport.send_message(request).await {
            Ok(accepted) => {
                self.apply(Input::RequestAccepted {
                    tracking_id: accepted.tracking_id,
                });
                Ok(conversation_id)
            }
            Err(e) => Err(self.fail(generation, e.into())),
        }
    }

    /// Clear results and return to idle. Keeps the conversation.
    pub fn reset(&self) {
        self.apply(Input::Reset);
    }

    /// Reset and forget the conversation; the next invocation creates a new one.
    pub fn clear_conversation(&self) {
        self.apply(Input::ClearConversation);
    }

    /// Adopt an existing conversation (e.g. restored from storage).
    pub async fn set_conversation_id(&self, conversation_id: impl Into<String>) {
        let conversation_id = conversation_id.into();
        if self.conversation_id().as_deref() == Some(conversation_id.as_str()) {
            return;
        }
        self.attach(&conversation_id);
        self.apply(Input::RestoreConversation {
            conversation_id: conversation_id.clone(),
        });
        self.join(&conversation_id).await;
    }

    // -- Internals ------------------------------------------------------------

    /// Atomically check the single-flight guard and enter Analyzing.
    /// Returns the generation of the new invocation.
    fn begin(&self, tool_name: &str) -> Result<u64, ClientError> {
        let mut rejected = false;
        let mut generation = 0;
        self.inner.state.send_if_modified(|state| {
            if state.phase.is_active() {
                rejected = true;
                return false;
            }
            let (next, _) = transition(
                state.clone(),
                Input::InvokeStarted {
                    tool_name: tool_name.to_string(),
                },
                Instant::now(),
            );
            generation = next.generation;
            *state = next;
            true
        });

        if rejected {
            let error = ClientError::InvocationInProgress;
            warn!(
                component = "invocation",
                event = "invocation.rejected",
                panel_id = %self.inner.options.panel_id,
                tool_name = %tool_name,
                "Invocation already in progress"
            );
            if let Some(callback) = &self.inner.options.on_error {
                callback(&error.to_string());
            }
            return Err(error);
        }
        Ok(generation)
    }

    /// Panel tool set, narrowed by the character's catalog profile when it
    /// names one.
    fn allows(&self, tool_name: &str) -> bool {
        self.inner.filter.contains(tool_name)
            && self
                .inner
                .ctx
                .catalog
                .get(&self.inner.options.character_id)
                .map_or(true, |profile| profile.allows_tool(tool_name))
    }

    /// `Err(Cancelled)` once a reset or a newer invocation has replaced the
    /// one started under `generation`.
    fn still_current(&self, generation: u64, tool_name: &str) -> Result<(), ClientError> {
        if self.inner.state.borrow().generation == generation {
            return Ok(());
        }
        info!(
            component = "invocation",
            event = "invocation.superseded",
            panel_id = %self.inner.options.panel_id,
            tool_name = %tool_name,
            "Invocation reset before it was sent"
        );
        Err(ClientError::Cancelled)
    }

    async fn ensure_conversation(&self) -> Result<String, ClientError> {
        let _creating = self.inner.creating.lock().await;
        let (existing, epoch) = {
            let state = self.inner.state.borrow();
            (state.conversation_id.clone(), state.conversation_epoch)
        };
        if let Some(id) = existing {
            return Ok(id);
        }

        let panel_id = &self.inner.options.panel_id;
        // A sibling's conversation is shared until this controller clears.
        let shared = match epoch {
            0 => self.inner.ctx.panels.conversation_for(panel_id),
            _ => None,
        };
        let conversation_id = match shared {
            Some(existing) => existing,
            None => {
                let request = CreateConversation {
                    character_id: self.inner.options.character_id.clone(),
                    panel_id: panel_id.clone(),
                    metadata: self.inner.options.metadata.clone(),
                };
                self.inner
                    .ctx
                    .transport
                    .create_conversation(request)
                    .await
                    .map_err(|e| ClientError::CreationFailed(e.to_string()))?
            }
        };

        // Handlers go in before anything else can observe the id.
        self.attach(&conversation_id);
        self.apply(Input::ConversationReady {
            conversation_id: conversation_id.clone(),
            epoch,
        });
        if self.conversation_id().as_deref() != Some(conversation_id.as_str()) {
            self.detach();
            return Err(ClientError::Cancelled);
        }

        info!(
            component = "invocation",
            event = "conversation.ready",
            panel_id = %panel_id,
            conversation_id = %conversation_id,
        );

        self.join(&conversation_id).await;
        Ok(conversation_id)
    }

    /// Map the panel to `conversation_id`, holding one reference on it.
    async fn join(&self, conversation_id: &str) {
        let panel_id = &self.inner.options.panel_id;
        if !self.inner.retained.swap(true, Ordering::SeqCst) {
            self.inner.ctx.panels.retain_panel(panel_id);
        }
        self.inner
            .ctx
            .panels
            .join_panel(panel_id, conversation_id)
            .await;
    }

    /// Register this controller's handlers on `conversation_id`, replacing
    /// any previous registration.
    fn attach(&self, conversation_id: &str) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: EventHandler = Arc::new(move |message: &ServerMessage| {
            if let Some(inner) = weak.upgrade() {
                StreamingController { inner }.handle_event(message);
            }
        });

        let subscriptions = self.inner.ctx.router.on_conversation_events(
            conversation_id,
            &EventKind::INVOCATION,
            self.inner.filter.clone(),
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

    fn detach(&self) {
        let previous = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        drop(previous);
    }

    fn handle_event(&self, message: &ServerMessage) {
        let input = match message {
            ServerMessage::Chunk {
                tracking_id,
                full_content,
                ..
            } => Input::Chunk {
                tracking_id: tracking_id.clone(),
                full_content: full_content.clone(),
            },
            ServerMessage::Complete {
                tool_name,
                message_id,
                response,
                structured_analysis,
                usage,
                ..
            } => Input::Complete {
                tool_name: tool_name.clone(),
                message_id: message_id.clone(),
                response: response.clone(),
                structured_analysis: structured_analysis.as_ref().map(|raw| {
                    match &self.inner.options.structured_mapper {
                        Some(mapper) => mapper(raw),
                        None => raw.clone(),
                    }
                }),
                usage: usage.clone(),
            },
            ServerMessage::ToolError {
                error,
                validation_errors,
                ..
            } => Input::ToolError {
                error: error.clone(),
                validation_errors: validation_errors.clone(),
            },
            ServerMessage::Error { message, .. } => Input::ConnectionError {
                message: message.clone(),
            },
            _ => return,
        };
        self.apply(input);
    }

    /// Record a failure of the invocation started under `generation`.
    fn fail(&self, generation: u64, error: ClientError) -> ClientError {
        warn!(
            component = "invocation",
            event = "invocation.failed",
            panel_id = %self.inner.options.panel_id,
            error = %error,
        );
        self.apply(Input::Failed {
            generation,
            message: error.to_string(),
        });
        error
    }

    /// Refuse a request without disturbing an active invocation.
    fn reject(&self, error: ClientError) -> ClientError {
        warn!(
            component = "invocation",
            event = "invocation.rejected",
            panel_id = %self.inner.options.panel_id,
            error = %error,
        );
        self.apply(Input::Rejected {
            message: error.to_string(),
        });
        error
    }

    fn apply(&self, input: Input) {
        let label = input.label();
        let mut effects = Vec::new();
        let mut phases = ("", "");

        self.inner.state.send_if_modified(|state| {
            let (next, out) = transition(state.clone(), input, Instant::now());
            effects = out;
            phases = (state.phase.name(), next.phase.name());
            let changed = *state != next;
            *state = next;
            changed
        });

        if phases.0 != phases.1 {
            debug!(
                component = "invocation",
                event = "invocation.transition",
                panel_id = %self.inner.options.panel_id,
                input = label,
                from = phases.0,
                to = phases.1,
            );
        }

        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::Cancel { conversation_id } => {
                info!(
                    component = "invocation",
                    event = "invocation.cancel",
                    panel_id = %self.inner.options.panel_id,
                    conversation_id = %conversation_id,
                );
                self.inner.ctx.transport.cancel_request(&conversation_id);
            }
            Effect::NotifyComplete(result) => {
                if let Some(callback) = &self.inner.options.on_complete {
                    callback(&result);
                }
            }
            Effect::NotifyError(message) => {
                if let Some(callback) = &self.inner.options.on_error {
                    callback(&message);
                }
            }
            Effect::ReleaseConversation { conversation_id } => {
                self.detach();
                if self.inner.retained.swap(false, Ordering::SeqCst) {
                    self.inner
                        .ctx
                        .panels
                        .release_panel(&self.inner.options.panel_id);
                }
                debug!(
                    component = "invocation",
                    event = "conversation.released",
                    panel_id = %self.inner.options.panel_id,
                    conversation_id = %conversation_id,
                );
            }
            Effect::Dropped { reason } => {
                debug!(
                    component = "invocation",
                    event = "invocation.event_dropped",
                    panel_id = %self.inner.options.panel_id,
                    reason = reason,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CharacterProfile, StaticCharacterCatalog};
    use crate::error::TransportError;
    use crate::router::ConversationEventRouter;
    use crate::test_support::{chunk, complete, test_context, RecordingTransport, TransportCall};
    use colloquy_protocol::ValidationError;
    use serde_json::json;

    const HEADLINE_FIELDS: &[&str] = &["score", "strengths", "weaknesses", "improvements"];

    fn headline_controller() -> (StreamingController, Arc<RecordingTransport>, StreamingContext) {
        let (ctx, transport) = test_context();
        let options = ControllerOptions::new(
            "headline_analyzer",
            "analyst",
            ["analyze_headline", "generate_headline"],
        )
        .with_mapper(select_fields(HEADLINE_FIELDS));
        (StreamingController::new(ctx.clone(), options), transport, ctx)
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn analyze_headline_end_to_end() {
        let (controller, transport, ctx) = headline_controller();
        assert_eq!(controller.snapshot().phase, "idle");

        let conversation_id = controller
            .invoke_tool(
                "analyze_headline",
                args(json!({"headline": "Grow 10x", "platform": "linkedin"})),
            )
            .await
            .unwrap();
        assert_eq!(controller.snapshot().phase, "analyzing");
        assert_eq!(controller.snapshot().tracking_id.as_deref(), Some("track-1"));

        let invokes = transport.invokes();
        assert_eq!(invokes.len(), 1);
        assert_eq!(invokes[0].tool_name, "analyze_headline");
        assert_eq!(invokes[0].arguments["platform"], "linkedin");

        ctx.router
            .dispatch(&chunk(&conversation_id, "analyze_headline", 0, "Strong"));
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "streaming");
        assert!(snap.is_streaming);

        ctx.router
            .dispatch(&complete(&conversation_id, "analyze_headline"));
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "complete");
        assert_eq!(
            snap.structured_analysis,
            Some(json!({
                "score": 82,
                "strengths": ["specific number"],
                "weaknesses": ["vague audience"],
                "improvements": ["name the audience"],
            }))
        );
        let metrics = snap.metrics.unwrap();
        assert_eq!(metrics.tokens(), 140);
        assert_eq!(metrics.duration_ms, Some(850));
        assert_eq!(snap.message_id.as_deref(), Some("msg-1"));
        assert_eq!(snap.active_tool.as_deref(), Some("analyze_headline"));
    }

    #[tokio::test]
    async fn second_invoke_while_analyzing_is_rejected() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let (ctx, transport) = test_context();
        let controller = StreamingController::new(
            ctx,
            ControllerOptions::new("headline_analyzer", "analyst", ["analyze_headline"])
                .on_error(move |msg| sink.lock().unwrap().push(msg.to_string())),
        );

        controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        let before = controller.snapshot();

        let second = controller.invoke_tool("analyze_headline", Map::new()).await;

        assert_eq!(second, Err(ClientError::InvocationInProgress));
        assert_eq!(transport.invokes().len(), 1);
        assert_eq!(transport.creates(), 1);
        assert_eq!(controller.snapshot(), before);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chunks_are_monotonic_replacements() {
        let (controller, _transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();

        let frames = ["Gr", "Grow", "Grow 10x", "Grow 10x today"];
        for (i, frame) in frames.iter().enumerate() {
            ctx.router
                .dispatch(&chunk(&id, "analyze_headline", i as u64, frame));
            assert_eq!(controller.snapshot().streaming_content, *frame);
        }
    }

    #[tokio::test]
    async fn complete_without_chunks_is_accepted() {
        let (controller, _transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("generate_headline", Map::new())
            .await
            .unwrap();

        ctx.router.dispatch(&complete(&id, "generate_headline"));
        assert_eq!(controller.snapshot().phase, "complete");
    }

    #[tokio::test]
    async fn reset_keeps_conversation_for_follow_up() {
        let (controller, transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&complete(&id, "analyze_headline"));

        controller.reset();
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "idle");
        assert_eq!(snap.conversation_id.as_deref(), Some(id.as_str()));
        assert!(snap.structured_analysis.is_none());

        let follow_up = controller
            .send_follow_up_message("Make it punchier")
            .await
            .unwrap();
        assert_eq!(follow_up, id);
        assert_eq!(transport.creates(), 1);
        assert!(transport.calls().contains(&TransportCall::SendMessage(SendMessage {
            conversation_id: id.clone(),
            character_id: "analyst".into(),
            content: "Make it punchier".into(),
        })));
        assert_eq!(controller.snapshot().phase, "analyzing");
    }

    #[tokio::test]
    async fn clear_conversation_forces_new_creation() {
        let (controller, transport, ctx) = headline_controller();
        let first = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&complete(&first, "analyze_headline"));

        controller.clear_conversation();
        assert!(controller.snapshot().conversation_id.is_none());
        assert_eq!(ctx.router.subscriber_count(&first), 0);

        let second = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(transport.creates(), 2);
    }

    #[tokio::test]
    async fn tool_error_surfaces_validation_message() {
        let (controller, _transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();

        ctx.router.dispatch(&ServerMessage::ToolError {
            conversation_id: id,
            tool_name: Some("analyze_headline".into()),
            error: Some("Invalid arguments".into()),
            validation_errors: vec![ValidationError {
                field: "headline".into(),
                message: "required".into(),
            }],
        });

        let snap = controller.snapshot();
        assert_eq!(snap.phase, "error");
        assert_eq!(snap.error.as_deref(), Some("headline: required"));
        assert!(!snap.is_analyzing);
    }

    #[tokio::test]
    async fn not_connected_fails_without_sending() {
        let (controller, transport, _ctx) = headline_controller();
        transport.set_connected(false);

        let result = controller.invoke_tool("analyze_headline", Map::new()).await;

        assert_eq!(result, Err(ClientError::NotConnected));
        assert!(transport.calls().is_empty());
        let snap = controller.snapshot();
        assert_eq!(snap.error.as_deref(), Some("Not connected to the AI service"));
        assert!(!snap.is_connected);
    }

    #[tokio::test]
    async fn unsupported_tool_is_refused() {
        let (controller, transport, _ctx) = headline_controller();

        let result = controller.invoke_tool("optimize_profile", Map::new()).await;

        assert_eq!(
            result,
            Err(ClientError::UnsupportedTool("optimize_profile".into()))
        );
        assert!(transport.calls().is_empty());
        assert_eq!(controller.snapshot().phase, "error");
    }

    #[tokio::test]
    async fn creation_failure_is_recoverable() {
        let (controller, transport, _ctx) = headline_controller();
        transport.fail_next_create(TransportError::Rejected("quota exceeded".into()));

        let result = controller.invoke_tool("analyze_headline", Map::new()).await;
        assert!(matches!(result, Err(ClientError::CreationFailed(_))));
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "error");
        assert!(snap.conversation_id.is_none());
        assert!(transport.invokes().is_empty());

        controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        assert_eq!(transport.creates(), 2);
        assert_eq!(transport.invokes().len(), 1);
    }

    #[tokio::test]
    async fn connection_error_applies_in_any_phase() {
        let (controller, _transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&complete(&id, "analyze_headline"));

        ctx.router.dispatch(&ServerMessage::Error {
            conversation_id: None,
            character_id: None,
            message: "connection lost".into(),
        });

        assert_eq!(controller.snapshot().error.as_deref(), Some("connection lost"));
    }

    #[tokio::test]
    async fn other_tools_on_same_conversation_are_ignored() {
        let (controller, _transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();

        ctx.router
            .dispatch(&chunk(&id, "analyze_profile", 0, "not for this panel"));

        let snap = controller.snapshot();
        assert_eq!(snap.phase, "analyzing");
        assert_eq!(snap.streaming_content, "");
    }

    #[tokio::test]
    async fn reset_during_stream_cancels_and_drops_late_frames() {
        let (controller, transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&chunk(&id, "analyze_headline", 0, "Gro"));

        controller.reset();
        assert_eq!(transport.cancels(), vec![id.clone()]);

        ctx.router.dispatch(&chunk(&id, "analyze_headline", 1, "Grow"));
        ctx.router.dispatch(&complete(&id, "analyze_headline"));
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "idle");
        assert_eq!(snap.streaming_content, "");
        assert!(snap.structured_analysis.is_none());
    }

    #[tokio::test]
    async fn on_complete_receives_mapped_result() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let (ctx, _transport) = test_context();
        let controller = StreamingController::new(
            ctx.clone(),
            ControllerOptions::new("headline_analyzer", "analyst", ["analyze_headline"])
                .with_mapper(select_fields(&["score"]))
                .on_complete(move |result| sink.lock().unwrap().push(result.clone())),
        );

        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&complete(&id, "analyze_headline"));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].structured_analysis, Some(json!({"score": 82})));
        assert_eq!(results[0].message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn follow_up_requires_conversation() {
        let (controller, transport, _ctx) = headline_controller();
        let result = controller.send_follow_up_message("hello?").await;
        assert_eq!(result, Err(ClientError::NoConversation));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn set_conversation_id_routes_restored_conversation() {
        let (controller, transport, ctx) = headline_controller();
        controller.set_conversation_id("conv-restored").await;

        assert!(ctx.router.subscriber_count("conv-restored") > 0);
        assert_eq!(
            ctx.panels.conversation_for("headline_analyzer").as_deref(),
            Some("conv-restored")
        );

        controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        assert_eq!(transport.creates(), 0);
        assert_eq!(transport.invokes()[0].conversation_id, "conv-restored");
    }

    #[tokio::test]
    async fn refused_invoke_does_not_disturb_live_stream() {
        let (controller, transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        ctx.router.dispatch(&chunk(&id, "analyze_headline", 0, "Grow"));

        let unsupported = controller.invoke_tool("optimize_profile", Map::new()).await;
        assert_eq!(unsupported, Err(ClientError::InvocationInProgress));

        transport.set_connected(false);
        let offline = controller.invoke_tool("analyze_headline", Map::new()).await;
        assert_eq!(offline, Err(ClientError::InvocationInProgress));
        let follow_up = controller.send_follow_up_message("and?").await;
        assert_eq!(follow_up, Err(ClientError::NotConnected));
        transport.set_connected(true);

        let snap = controller.snapshot();
        assert_eq!(snap.phase, "streaming");
        assert_eq!(snap.streaming_content, "Grow");
        assert!(snap.error.is_none());

        ctx.router.dispatch(&complete(&id, "analyze_headline"));
        assert_eq!(controller.snapshot().phase, "complete");
        assert_eq!(transport.invokes().len(), 1);
    }

    #[tokio::test]
    async fn reset_during_creation_abandons_the_send() {
        let (controller, transport, _ctx) = headline_controller();
        let release = transport.hold_next_create();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.invoke_tool("analyze_headline", Map::new()).await }
        });
        while transport.creates() == 0 {
            tokio::task::yield_now().await;
        }

        controller.reset();
        assert_eq!(controller.snapshot().phase, "idle");
        assert!(transport.cancels().is_empty());

        let second = tokio::spawn({
            let controller = controller.clone();
            async move { controller.invoke_tool("generate_headline", Map::new()).await }
        });
        tokio::task::yield_now().await;
        release.send(()).unwrap();

        assert_eq!(first.await.unwrap(), Err(ClientError::Cancelled));
        let id = second.await.unwrap().unwrap();

        assert_eq!(transport.creates(), 1);
        let invokes = transport.invokes();
        assert_eq!(invokes.len(), 1);
        assert_eq!(invokes[0].tool_name, "generate_headline");
        assert_eq!(invokes[0].conversation_id, id);
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "analyzing");
        assert_eq!(snap.active_tool.as_deref(), Some("generate_headline"));
    }

    #[tokio::test]
    async fn clear_during_creation_discards_the_new_conversation() {
        let (controller, transport, ctx) = headline_controller();
        let release = transport.hold_next_create();

        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.invoke_tool("analyze_headline", Map::new()).await }
        });
        while transport.creates() == 0 {
            tokio::task::yield_now().await;
        }

        controller.clear_conversation();
        release.send(()).unwrap();

        assert_eq!(pending.await.unwrap(), Err(ClientError::Cancelled));
        let snap = controller.snapshot();
        assert_eq!(snap.phase, "idle");
        assert!(snap.conversation_id.is_none());
        assert!(transport.invokes().is_empty());
        assert_eq!(ctx.router.subscriber_count("conv-1"), 0);
        assert!(ctx.panels.conversation_for("headline_analyzer").is_none());
    }

    #[tokio::test]
    async fn character_profile_narrows_panel_tools() {
        let transport = RecordingTransport::new();
        let writer = CharacterProfile {
            tools: vec!["generate_headline".into()],
            ..CharacterProfile::new("writer", "Wes the Writer")
        };
        let ctx = StreamingContext::new(
            transport.clone(),
            ConversationEventRouter::new(),
            Arc::new(StaticCharacterCatalog::new(vec![writer])),
        );
        let controller = StreamingController::new(
            ctx,
            ControllerOptions::new(
                "headline_analyzer",
                "writer",
                ["analyze_headline", "generate_headline"],
            ),
        );

        let refused = controller.invoke_tool("analyze_headline", Map::new()).await;
        assert_eq!(
            refused,
            Err(ClientError::UnsupportedTool("analyze_headline".into()))
        );
        assert!(transport.calls().is_empty());

        controller
            .invoke_tool("generate_headline", Map::new())
            .await
            .unwrap();
        assert_eq!(transport.invokes().len(), 1);
    }

    #[tokio::test]
    async fn sibling_controllers_share_panel_until_last_drops() {
        let (ctx, transport) = test_context();
        let options = ControllerOptions::new("headline_analyzer", "analyst", ["analyze_headline"]);
        let first = StreamingController::new(ctx.clone(), options.clone());
        let second = StreamingController::new(ctx.clone(), options);

        let id = first
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        drop(StreamingController::new(
            ctx.clone(),
            ControllerOptions::new("headline_analyzer", "analyst", ["analyze_headline"]),
        ));
        assert_eq!(
            ctx.panels.conversation_for("headline_analyzer").as_deref(),
            Some(id.as_str())
        );

        let shared = second
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();
        assert_eq!(id, shared);
        assert_eq!(transport.creates(), 1);
        assert_eq!(ctx.panels.holder_count("headline_analyzer"), 2);

        let leaves = || transport.count(|c| matches!(c, TransportCall::LeavePanel(_)));
        drop(first);
        assert_eq!(leaves(), 0);
        assert_eq!(
            ctx.panels.conversation_for("headline_analyzer").as_deref(),
            Some(id.as_str())
        );
        ctx.router
            .dispatch(&chunk(&id, "analyze_headline", 0, "still routed"));
        assert_eq!(second.snapshot().streaming_content, "still routed");

        drop(second);
        assert_eq!(leaves(), 1);
        assert!(ctx.panels.conversation_for("headline_analyzer").is_none());
    }

    #[tokio::test]
    async fn dropping_controller_leaves_panel() {
        let (controller, transport, ctx) = headline_controller();
        let id = controller
            .invoke_tool("analyze_headline", Map::new())
            .await
            .unwrap();

        drop(controller);

        assert_eq!(ctx.router.subscriber_count(&id), 0);
        assert!(ctx.panels.conversation_for("headline_analyzer").is_none());
        assert!(transport
            .calls()
            .contains(&TransportCall::LeavePanel("headline_analyzer".into())));
    }
}
