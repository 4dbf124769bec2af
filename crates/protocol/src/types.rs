//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Turn-taking mode of a multi-character session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiCharacterMode {
    Sequential,
    Simultaneous,
    Discussion,
    Moderated,
}

impl MultiCharacterMode {
    /// Whether the server announces whose turn it is (`character_turn`).
    pub fn has_turns(self) -> bool {
        !matches!(self, MultiCharacterMode::Simultaneous)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MultiCharacterMode::Sequential => "sequential",
            MultiCharacterMode::Simultaneous => "simultaneous",
            MultiCharacterMode::Discussion => "discussion",
            MultiCharacterMode::Moderated => "moderated",
        }
    }
}

impl std::str::FromStr for MultiCharacterMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(MultiCharacterMode::Sequential),
            "simultaneous" => Ok(MultiCharacterMode::Simultaneous),
            "discussion" => Ok(MultiCharacterMode::Discussion),
            "moderated" => Ok(MultiCharacterMode::Moderated),
            other => Err(format!("unknown multi-character mode: {other}")),
        }
    }
}

/// Status of one character's response slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    #[default]
    Pending,
    Processing,
    Streaming,
    Complete,
    Error,
}

impl CharacterStatus {
    /// Processing or streaming
    pub fn is_active(self) -> bool {
        matches!(self, CharacterStatus::Processing | CharacterStatus::Streaming)
    }
}

/// Token/cost/duration usage reported on completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl UsageMetrics {
    /// Total tokens, falling back to input + output when the server omits it
    pub fn tokens(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens
        }
    }
}

/// Field-level argument rejection from a server-side tool handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Join validation errors as `"field: message, field: message"`.
pub fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Routable event kinds delivered by the server for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chunk,
    Complete,
    ToolError,
    Error,
    MultiCharacterStart,
    CharacterTurn,
    Processing,
    StreamingComplete,
    MultiCharacterComplete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Chunk => "chunk",
            EventKind::Complete => "complete",
            EventKind::ToolError => "tool_error",
            EventKind::Error => "error",
            EventKind::MultiCharacterStart => "multi_character_start",
            EventKind::CharacterTurn => "character_turn",
            EventKind::Processing => "processing",
            EventKind::StreamingComplete => "streaming_complete",
            EventKind::MultiCharacterComplete => "multi_character_complete",
        }
    }

    /// Kinds consumed by a single tool-invocation subscriber
    pub const INVOCATION: [EventKind; 4] = [
        EventKind::Chunk,
        EventKind::Complete,
        EventKind::ToolError,
        EventKind::Error,
    ];

    /// Kinds consumed by a multi-character session subscriber
    pub const MULTI_CHARACTER: [EventKind; 7] = [
        EventKind::MultiCharacterStart,
        EventKind::CharacterTurn,
        EventKind::Processing,
        EventKind::Chunk,
        EventKind::StreamingComplete,
        EventKind::Error,
        EventKind::MultiCharacterComplete,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
