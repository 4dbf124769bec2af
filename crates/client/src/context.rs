//! Shared dependencies handed to every controller.

use std::sync::Arc;

use crate::catalog::CharacterCatalog;
use crate::panel::PanelRegistry;
use crate::router::ConversationEventRouter;
use crate::transport::Transport;

/// One per application session. Cheap to Clone; every clone shares the same
/// transport, router and panel registry.
#[derive(Clone)]
pub struct StreamingContext {
    pub transport: Arc<dyn Transport>,
    pub router: ConversationEventRouter,
    pub panels: PanelRegistry,
    pub catalog: Arc<dyn CharacterCatalog>,
}

impl StreamingContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        router: ConversationEventRouter,
        catalog: Arc<dyn CharacterCatalog>,
    ) -> Self {
        let panels = PanelRegistry::new(transport.clone(), router.clone());
        Self {
            transport,
            router,
            panels,
            catalog,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
