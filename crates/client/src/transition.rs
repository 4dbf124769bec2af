//! Pure state transition function for a streaming tool invocation
//!
//! All business logic for invocation state changes lives here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! No IO, async or locking, so it unit-tests directly.

use std::time::Instant;

use colloquy_protocol::{format_validation_errors, UsageMetrics, ValidationError};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// InvocationPhase: the per-conversation state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum InvocationPhase {
    #[default]
    Idle,
    /// Request sent, no content yet. `tool_name` is `None` for follow-ups.
    Analyzing { tool_name: Option<String> },
    Streaming { tool_name: Option<String> },
    Complete,
    Error { message: String },
}

impl InvocationPhase {
    /// Analyzing or Streaming. The single-flight guard refuses new work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InvocationPhase::Analyzing { .. } | InvocationPhase::Streaming { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            InvocationPhase::Idle => "idle",
            InvocationPhase::Analyzing { .. } => "analyzing",
            InvocationPhase::Streaming { .. } => "streaming",
            InvocationPhase::Complete => "complete",
            InvocationPhase::Error { .. } => "error",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            InvocationPhase::Analyzing { tool_name } | InvocationPhase::Streaming { tool_name } => {
                tool_name.as_deref()
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationState: pure data owned by one controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvocationState {
    pub conversation_id: Option<String>,
    pub phase: InvocationPhase,
    /// Server-authoritative cumulative content of the current response
    pub streaming_content: String,
    /// Raw `response` payload of the last completion
    pub analysis: Option<Value>,
    pub structured_analysis: Option<Value>,
    pub metrics: Option<UsageMetrics>,
    pub message_id: Option<String>,
    pub tracking_id: Option<String>,
    /// Bumped whenever a new invocation starts or the current one is reset,
    /// so an in-flight send can tell it was superseded
    pub generation: u64,
    /// Bumped when the conversation is cleared
    pub conversation_epoch: u64,
    /// Tool of the last accepted invocation, kept after completion
    pub last_tool: Option<String>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

impl InvocationState {
    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            InvocationPhase::Error { message } => Some(message),
            _ => None,
        }
    }

    fn clear_result(&mut self) {
        self.streaming_content.clear();
        self.analysis = None;
        self.structured_analysis = None;
        self.metrics = None;
        self.message_id = None;
    }
}

/// Result handed to completion callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub tool_name: Option<String>,
    pub content: String,
    pub response: Value,
    pub structured_analysis: Option<Value>,
    pub usage: Option<UsageMetrics>,
    pub message_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Input: local actions and transport events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    InvokeStarted {
        tool_name: String,
    },
    FollowUpStarted,
    /// A conversation created (or adopted) under `epoch`
    ConversationReady {
        conversation_id: String,
        epoch: u64,
    },
    RequestAccepted {
        tracking_id: Option<String>,
    },
    Chunk {
        tracking_id: Option<String>,
        full_content: String,
    },
    Complete {
        tool_name: Option<String>,
        message_id: Option<String>,
        response: Value,
        /// Already passed through the caller's mapper
        structured_analysis: Option<Value>,
        usage: Option<UsageMetrics>,
    },
    ToolError {
        error: Option<String>,
        validation_errors: Vec<ValidationError>,
    },
    /// Connection-level error, applied regardless of phase
    ConnectionError {
        message: String,
    },
    /// Local failure of the invocation started under `generation`
    Failed {
        generation: u64,
        message: String,
    },
    /// Local refusal that must not disturb an active invocation
    Rejected {
        message: String,
    },
    Reset,
    ClearConversation,
    RestoreConversation {
        conversation_id: String,
    },
}

impl Input {
    pub fn label(&self) -> &'static str {
        match self {
            Input::InvokeStarted { .. } => "invoke_started",
            Input::FollowUpStarted => "follow_up_started",
            Input::ConversationReady { .. } => "conversation_ready",
            Input::RequestAccepted { .. } => "request_accepted",
            Input::Chunk { .. } => "chunk",
            Input::Complete { .. } => "complete",
            Input::ToolError { .. } => "tool_error",
            Input::ConnectionError { .. } => "connection_error",
            Input::Failed { .. } => "failed",
            Input::Rejected { .. } => "rejected",
            Input::Reset => "reset",
            Input::ClearConversation => "clear_conversation",
            Input::RestoreConversation { .. } => "restore_conversation",
        }
    }
}

// ---------------------------------------------------------------------------
// Effects: describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Fire-and-forget server cancel
    Cancel { conversation_id: String },
    NotifyComplete(Box<AnalysisResult>),
    NotifyError(String),
    /// Drop event subscriptions and leave the panel for this conversation
    ReleaseConversation { conversation_id: String },
    /// Input ignored in the current phase
    Dropped { reason: &'static str },
}

// ---------------------------------------------------------------------------
// transition(): the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input, returns the new state and the
/// effects (cancel requests, callbacks, teardown) to execute.
pub fn transition(
    mut state: InvocationState,
    input: Input,
    now: Instant,
) -> (InvocationState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Local actions ----------------------------------------------------
        Input::InvokeStarted { tool_name } => {
            state.clear_result();
            state.tracking_id = None;
            state.generation += 1;
            state.last_tool = Some(tool_name.clone());
            state.started_at = Some(now);
            state.phase = InvocationPhase::Analyzing {
                tool_name: Some(tool_name),
            };
        }

        Input::FollowUpStarted => {
            // Follow-ups bypass the single-flight guard; an active stream
            // keeps its phase.
            if !state.phase.is_active() {
                state.clear_result();
                state.tracking_id = None;
                state.generation += 1;
                state.started_at = Some(now);
                state.phase = InvocationPhase::Analyzing { tool_name: None };
            }
        }

        Input::ConversationReady {
            conversation_id,
            epoch,
        } => {
            if epoch == state.conversation_epoch && state.conversation_id.is_none() {
                state.conversation_id = Some(conversation_id);
            } else {
                effects.push(Effect::Dropped {
                    reason: "conversation created after it was cleared",
                });
            }
        }

        Input::RestoreConversation { conversation_id } => {
            state.conversation_id = Some(conversation_id);
        }

        Input::RequestAccepted { tracking_id } => {
            if state.phase.is_active() {
                if tracking_id.is_some() {
                    state.tracking_id = tracking_id;
                }
            } else {
                effects.push(Effect::Dropped {
                    reason: "ack after invocation ended",
                });
            }
        }

        // -- Transport events -------------------------------------------------
        Input::Chunk {
            tracking_id,
            full_content,
        } => match state.phase {
            InvocationPhase::Analyzing { tool_name } | InvocationPhase::Streaming { tool_name } => {
                state.phase = InvocationPhase::Streaming { tool_name };
                // Replace, never append: the server owns accumulation order.
                state.streaming_content = full_content;
                if tracking_id.is_some() {
                    state.tracking_id = tracking_id;
                }
            }
            phase => {
                state.phase = phase;
                effects.push(Effect::Dropped {
                    reason: "chunk outside an active invocation",
                });
            }
        },

        Input::Complete {
            tool_name,
            message_id,
            response,
            structured_analysis,
            usage,
        } => {
            if state.phase.is_active() {
                let tool_name = tool_name.or_else(|| state.phase.tool_name().map(String::from));
                if state.streaming_content.is_empty() {
                    if let Value::String(text) = &response {
                        state.streaming_content = text.clone();
                    }
                }
                // Fall back to locally measured latency.
                let usage = usage.map(|mut usage| {
                    if usage.duration_ms.is_none() {
                        usage.duration_ms = state
                            .started_at
                            .map(|start| now.saturating_duration_since(start).as_millis() as u64);
                    }
                    usage
                });
                state.phase = InvocationPhase::Complete;
                state.analysis = Some(response.clone());
                state.structured_analysis = structured_analysis.clone();
                state.metrics = usage.clone();
                state.message_id = message_id.clone();

                effects.push(Effect::NotifyComplete(Box::new(AnalysisResult {
                    tool_name,
                    content: state.streaming_content.clone(),
                    response,
                    structured_analysis,
                    usage,
                    message_id,
                })));
            } else {
                effects.push(Effect::Dropped {
                    reason: "complete outside an active invocation",
                });
            }
        }

        Input::ToolError {
            error,
            validation_errors,
        } => {
            if state.phase.is_active() {
                let message = if validation_errors.is_empty() {
                    error.unwrap_or_else(|| "Tool execution failed".to_string())
                } else {
                    format_validation_errors(&validation_errors)
                };
                state.phase = InvocationPhase::Error {
                    message: message.clone(),
                };
                effects.push(Effect::NotifyError(message));
            } else {
                effects.push(Effect::Dropped {
                    reason: "tool_error outside an active invocation",
                });
            }
        }

        Input::ConnectionError { message } => {
            state.phase = InvocationPhase::Error {
                message: message.clone(),
            };
            effects.push(Effect::NotifyError(message));
        }

        Input::Failed {
            generation,
            message,
        } => {
            if generation == state.generation {
                state.phase = InvocationPhase::Error {
                    message: message.clone(),
                };
                effects.push(Effect::NotifyError(message));
            } else {
                effects.push(Effect::Dropped {
                    reason: "failure of a superseded invocation",
                });
            }
        }

        Input::Rejected { message } => {
            if !state.phase.is_active() {
                state.phase = InvocationPhase::Error {
                    message: message.clone(),
                };
            }
            effects.push(Effect::NotifyError(message));
        }

        // -- Teardown ---------------------------------------------------------
        Input::Reset => {
            reset(&mut state, &mut effects);
        }

        Input::ClearConversation => {
            reset(&mut state, &mut effects);
            state.conversation_epoch += 1;
            if let Some(conversation_id) = state.conversation_id.take() {
                effects.push(Effect::ReleaseConversation { conversation_id });
            }
            state.last_tool = None;
        }
    }

    (state, effects)
}

fn reset(state: &mut InvocationState, effects: &mut Vec<Effect>) {
    if let Some(conversation_id) = &state.conversation_id {
        if state.tracking_id.is_some() || state.phase.is_active() {
            effects.push(Effect::Cancel {
                conversation_id: conversation_id.clone(),
            });
        }
    }
    state.clear_result();
    state.tracking_id = None;
    state.generation += 1;
    state.started_at = None;
    state.phase = InvocationPhase::Idle;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
