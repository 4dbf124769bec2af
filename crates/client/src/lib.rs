//! Colloquy client
//!
//! Client-side orchestration for real-time AI conversations: panels mapped
//! to conversations, an event router multiplexing one connection across
//! many subscribers, the streaming tool-invocation state machine and
//! multi-character sessions.

pub mod catalog;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod features;
pub mod multi_character;
pub mod panel;
pub mod router;
pub mod transition;
pub mod transport;
pub mod ws_transport;

#[cfg(test)]
mod test_support;

pub use catalog::{CharacterCatalog, CharacterProfile, StaticCharacterCatalog};
pub use config::ClientConfig;
pub use context::StreamingContext;
pub use controller::{
    select_fields, ControllerOptions, InvocationSnapshot, StreamingController, StructuredMapper,
};
pub use error::{ClientError, ConfigError, TransportError};
pub use features::{
    ContentAnalysis, FeatureController, HeadlineAnalysis, ProfileAnalysis, ProposalAssistant,
    ViralPost,
};
pub use multi_character::{
    CharacterEntry, CharacterResponse, MultiCharacterController, MultiCharacterState,
};
pub use panel::{PanelRegistry, PanelState};
pub use router::{ConversationEventRouter, Subscription, ToolFilter};
pub use transition::{AnalysisResult, InvocationPhase, InvocationState};
pub use transport::Transport;
pub use ws_transport::{ConnectionState, WsTransport};
