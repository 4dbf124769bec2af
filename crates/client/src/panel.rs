//! Panel registry: maps UI surfaces (panels) to conversations.
//!
//! Each panel keeps a lock-free [`PanelState`] snapshot maintained from the
//! router's events, for consumers that don't need a full controller.

use std::sync::Arc;

use arc_swap::ArcSwap;
use colloquy_protocol::{format_validation_errors, EventKind, ServerMessage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::router::{ConversationEventRouter, Subscription, ToolFilter};
use crate::transport::Transport;

/// Read-only view of a panel's streaming state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PanelState {
    pub panel_id: String,
    pub conversation_id: Option<String>,
    pub is_streaming: bool,
    pub content: String,
    pub error: Option<String>,
}

impl PanelState {
    fn apply(&self, message: &ServerMessage) -> PanelState {
        let mut next = self.clone();
        match message {
            ServerMessage::Chunk { full_content, .. } => {
                next.is_streaming = true;
                next.content = full_content.clone();
                next.error = None;
            }
            ServerMessage::Complete { .. } | ServerMessage::StreamingComplete { .. } => {
                next.is_streaming = false;
            }
            ServerMessage::ToolError {
                error,
                validation_errors,
                ..
            } => {
                next.is_streaming = false;
                next.error = Some(if validation_errors.is_empty() {
                    error.clone().unwrap_or_else(|| "Tool failed".to_string())
                } else {
                    format_validation_errors(validation_errors)
                });
            }
            ServerMessage::Error { message, .. } => {
                next.is_streaming = false;
                next.error = Some(message.clone());
            }
            _ => {}
        }
        next
    }
}

struct PanelEntry {
    conversation_id: String,
    /// Whether the transport has confirmed routing for this mapping
    joined: bool,
    state: Arc<ArcSwap<PanelState>>,
    _subscriptions: Vec<Subscription>,
}

struct RegistryInner {
    panels: DashMap<String, PanelEntry>,
    /// Controllers currently sharing each panel
    holders: DashMap<String, usize>,
    transport: Arc<dyn Transport>,
    router: ConversationEventRouter,
}

/// Shared panel registry handle (cheap to Clone).
#[derive(Clone)]
pub struct PanelRegistry {
    inner: Arc<RegistryInner>,
}

const PANEL_STATE_KINDS: [EventKind; 5] = [
    EventKind::Chunk,
    EventKind::Complete,
    EventKind::StreamingComplete,
    EventKind::ToolError,
    EventKind::Error,
];

impl PanelRegistry {
    pub fn new(transport: Arc<dyn Transport>, router: ConversationEventRouter) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                panels: DashMap::new(),
                holders: DashMap::new(),
                transport,
                router,
            }),
        }
    }

    /// Map `panel_id` to `conversation_id` and ask the transport to route
    /// the conversation's events to it.
    ///
    /// Idempotent. When the transport is offline the mapping is kept and the
    /// transport join is retried on the next call (or [`rejoin_all`]).
    /// Returns whether the transport is routing the conversation.
    ///
    /// [`rejoin_all`]: PanelRegistry::rejoin_all
    pub async fn join_panel(&self, panel_id: &str, conversation_id: &str) -> bool {
        let existing = self
            .inner
            .panels
            .get(panel_id)
            .map(|entry| (entry.conversation_id == conversation_id, entry.joined));

        match existing {
            Some((true, true)) => return true,
            Some((true, false)) => {}
            Some((false, was_joined)) => {
                // The transport routes one conversation per panel; release
                // the old one before joining the new.
                if was_joined {
                    self.inner.transport.leave_panel(panel_id);
                }
                info!(
                    component = "panel_registry",
                    event = "panel.remapped",
                    panel_id = %panel_id,
                    conversation_id = %conversation_id,
                    "Panel moved to a new conversation"
                );
                self.insert_entry(panel_id, conversation_id);
            }
            None => self.insert_entry(panel_id, conversation_id),
        }

        if !self.inner.transport.is_connected() {
            warn!(
                component = "panel_registry",
                event = "panel.join.offline",
                panel_id = %panel_id,
                conversation_id = %conversation_id,
                "Transport not connected, panel join deferred"
            );
            return false;
        }

        match self
            .inner
            .transport
            .join_panel(panel_id, conversation_id)
            .await
        {
            Ok(()) => {
                if let Some(mut entry) = self.inner.panels.get_mut(panel_id) {
                    if entry.conversation_id == conversation_id {
                        entry.joined = true;
                    }
                }
                debug!(
                    component = "panel_registry",
                    event = "panel.joined",
                    panel_id = %panel_id,
                    conversation_id = %conversation_id,
                );
                true
            }
            Err(e) => {
                warn!(
                    component = "panel_registry",
                    event = "panel.join.failed",
                    panel_id = %panel_id,
                    conversation_id = %conversation_id,
                    error = %e,
                    "Transport refused panel join"
                );
                false
            }
        }
    }

    fn insert_entry(&self, panel_id: &str, conversation_id: &str) {
        let state = Arc::new(ArcSwap::from_pointee(PanelState {
            panel_id: panel_id.to_string(),
            conversation_id: Some(conversation_id.to_string()),
            ..Default::default()
        }));

        let sink = state.clone();
        let subscriptions = self.inner.router.on_conversation_events(
            conversation_id,
            &PANEL_STATE_KINDS,
            ToolFilter::Any,
            Arc::new(move |message: &ServerMessage| {
                sink.rcu(|current| current.apply(message));
            }),
        );

        self.inner.panels.insert(
            panel_id.to_string(),
            PanelEntry {
                conversation_id: conversation_id.to_string(),
                joined: false,
                state,
                _subscriptions: subscriptions,
            },
        );
    }

    /// Unregister a panel and release its transport-side routing.
    pub fn leave_panel(&self, panel_id: &str) {
        let Some((_, entry)) = self.inner.panels.remove(panel_id) else {
            return;
        };
        if entry.joined {
            self.inner.transport.leave_panel(panel_id);
        }
        debug!(
            component = "panel_registry",
            event = "panel.left",
            panel_id = %panel_id,
            conversation_id = %entry.conversation_id,
        );
    }

    /// Register one more controller sharing `panel_id`.
    pub fn retain_panel(&self, panel_id: &str) {
        *self
            .inner
            .holders
            .entry(panel_id.to_string())
            .or_insert(0) += 1;
    }

    /// Drop one holder of `panel_id`, leaving the panel once the last one
    /// is gone.
    pub fn release_panel(&self, panel_id: &str) {
        match self.inner.holders.entry(panel_id.to_string()) {
            Entry::Occupied(mut held) => {
                let remaining = held.get().saturating_sub(1);
                if remaining == 0 {
                    held.remove();
                    self.leave_panel(panel_id);
                } else {
                    *held.get_mut() = remaining;
                }
            }
            Entry::Vacant(_) => {}
        }
    }

    pub fn holder_count(&self, panel_id: &str) -> usize {
        self.inner
            .holders
            .get(panel_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Lock-free snapshot of the panel's current streaming state.
    pub fn get_panel_state(&self, panel_id: &str) -> Option<Arc<PanelState>> {
        self.inner
            .panels
            .get(panel_id)
            .map(|entry| entry.state.load_full())
    }

    pub fn conversation_for(&self, panel_id: &str) -> Option<String> {
        self.inner
            .panels
            .get(panel_id)
            .map(|entry| entry.conversation_id.clone())
    }

    pub fn panels(&self) -> Vec<String> {
        self.inner
            .panels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Re-issue transport joins for every mapping not yet confirmed
    /// (e.g. after a reconnect). Returns how many panels were joined.
    pub async fn rejoin_all(&self) -> usize {
        let pending: Vec<(String, String)> = self
            .inner
            .panels
            .iter()
            .filter(|entry| !entry.joined)
            .map(|entry| (entry.key().clone(), entry.conversation_id.clone()))
            .collect();

        let mut joined = 0;
        for (panel_id, conversation_id) in pending {
            if self.join_panel(&panel_id, &conversation_id).await {
                joined += 1;
            }
        }
        joined
    }

    /// Mark every mapping as needing a transport join.
    pub fn mark_all_unjoined(&self) {
        for mut entry in self.inner.panels.iter_mut() {
            entry.joined = false;
        }
    }
}
