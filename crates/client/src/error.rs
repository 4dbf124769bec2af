//! Error types for the orchestration layer.

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::transport::Transport) call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Request timed out waiting for server acknowledgement")]
    Timeout,

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

/// Errors surfaced by the controllers. Failures of the caller's own request
/// are also recorded in the controller's `error` field; refusals that arrive
/// while another invocation is active leave that invocation untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not connected to the AI service")]
    NotConnected,

    #[error("An invocation is already in progress for this conversation")]
    InvocationInProgress,

    #[error("Tool '{0}' is not supported by this panel")]
    UnsupportedTool(String),

    #[error("No conversation exists for this panel")]
    NoConversation,

    #[error("A multi-character session is still streaming")]
    SessionInProgress,

    #[error("Failed to create conversation: {0}")]
    CreationFailed(String),

    #[error("Invocation was reset before it was sent")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors loading [`ClientConfig`](crate::config::ClientConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}
