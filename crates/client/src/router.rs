//! Conversation event router.
//!
//! Routes inbound [`ServerMessage`] events to the subscribers registered for
//! `(conversation_id, kind)`. Subscribers declare a [`ToolFilter`] so several
//! tool families can share one conversation's stream without cross-talk.
//! Generic `error` events bypass the filter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use colloquy_protocol::{EventKind, ServerMessage};
use dashmap::DashMap;
use tracing::{debug, trace};

pub type EventHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Which tool-scoped events a subscriber wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFilter {
    Any,
    Only(Arc<HashSet<String>>),
}

impl ToolFilter {
    pub fn only<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolFilter::Only(Arc::new(tools.into_iter().map(Into::into).collect()))
    }

    /// Events without a tool name are conversation-level and always admitted.
    pub fn admits(&self, tool_name: Option<&str>) -> bool {
        match (self, tool_name) {
            (ToolFilter::Any, _) | (_, None) => true,
            (ToolFilter::Only(tools), Some(name)) => tools.contains(name),
        }
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        match self {
            ToolFilter::Any => true,
            ToolFilter::Only(tools) => tools.contains(tool_name),
        }
    }
}

type RouteKey = (String, EventKind);

struct Subscriber {
    id: u64,
    filter: ToolFilter,
    handler: EventHandler,
}

#[derive(Default)]
struct RouterInner {
    routes: DashMap<RouteKey, Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Shared router handle (cheap to Clone).
#[derive(Clone, Default)]
pub struct ConversationEventRouter {
    inner: Arc<RouterInner>,
}

impl ConversationEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one event kind on one conversation.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    pub fn on_conversation_event<F>(
        &self,
        conversation_id: &str,
        kind: EventKind,
        filter: ToolFilter,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.subscribe_handler(conversation_id, kind, filter, Arc::new(handler))
    }

    /// Register one shared handler for several kinds at once.
    pub fn on_conversation_events(
        &self,
        conversation_id: &str,
        kinds: &[EventKind],
        filter: ToolFilter,
        handler: EventHandler,
    ) -> Vec<Subscription> {
        kinds
            .iter()
            .map(|kind| {
                self.subscribe_handler(conversation_id, *kind, filter.clone(), handler.clone())
            })
            .collect()
    }

    fn subscribe_handler(
        &self,
        conversation_id: &str,
        kind: EventKind,
        filter: ToolFilter,
        handler: EventHandler,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (conversation_id.to_string(), kind);
        self.inner
            .routes
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                id,
                filter,
                handler,
            });

        debug!(
            component = "router",
            event = "router.subscribed",
            conversation_id = %conversation_id,
            kind = %kind,
            subscription_id = id,
        );

        Subscription {
            router: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Deliver `message` to its subscribers. Returns how many handlers ran.
    ///
    /// Handlers run after the route table is released, so they may
    /// subscribe or unsubscribe re-entrantly.
    pub fn dispatch(&self, message: &ServerMessage) -> usize {
        let Some(kind) = message.event_kind() else {
            return 0;
        };

        let handlers: Vec<EventHandler> = match message.conversation_id() {
            Some(conversation_id) => self
                .inner
                .routes
                .get(&(conversation_id.to_string(), kind))
                .map(|subs| {
                    subs.iter()
                        .filter(|s| kind == EventKind::Error || s.filter.admits(message.tool_name()))
                        .map(|s| s.handler.clone())
                        .collect()
                })
                .unwrap_or_default(),
            // Connection-wide error: every conversation hears it.
            None => self
                .inner
                .routes
                .iter()
                .filter(|entry| entry.key().1 == kind)
                .flat_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .map(|s| s.handler.clone())
                        .collect::<Vec<_>>()
                })
                .collect(),
        };

        if handlers.is_empty() {
            trace!(
                component = "router",
                event = "router.dispatch.unrouted",
                conversation_id = ?message.conversation_id(),
                kind = %kind,
                tool_name = ?message.tool_name(),
            );
            return 0;
        }

        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    /// Number of live subscriptions on a conversation, across all kinds.
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.inner
            .routes
            .iter()
            .filter(|entry| entry.key().0 == conversation_id)
            .map(|entry| entry.value().len())
            .sum()
    }
}

/// Handle to a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    router: Weak<RouterInner>,
    key: RouteKey,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.router.upgrade() else {
            return;
        };
        let now_empty = match inner.routes.get_mut(&self.key) {
            Some(mut subs) => {
                subs.retain(|s| s.id != self.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.routes.remove_if(&self.key, |_, subs| subs.is_empty());
        }
        trace!(
            component = "router",
            event = "router.unsubscribed",
            conversation_id = %self.key.0,
            kind = %self.key.1,
            subscription_id = self.id,
        );
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.key.0)
            .field("kind", &self.key.1)
            .field("id", &self.id)
            .finish()
    }
}
