use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use colloquy_client::{ClientConfig, ConversationEventRouter, StreamingContext, WsTransport};
use tracing::info;

/// Global flags that override the loaded config
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub server_url: Option<String>,
    pub character: Option<String>,
}

pub struct Session {
    pub ctx: StreamingContext,
    pub config: ClientConfig,
    /// `--character`, if given
    pub character: Option<String>,
}

impl Session {
    /// Explicit flag, else the configured default.
    pub fn character_or_default(&self) -> String {
        self.character
            .clone()
            .unwrap_or_else(|| self.config.default_character_id.clone())
    }
}

pub async fn connect(overrides: &Overrides) -> anyhow::Result<Session> {
    let mut config = ClientConfig::load(overrides.config.as_deref())?;
    if let Some(url) = &overrides.server_url {
        config.server_url = url.clone();
    }
    if let Some(character) = &overrides.character {
        config.default_character_id = character.clone();
    }

    let router = ConversationEventRouter::new();
    let transport = WsTransport::spawn(config.clone(), router.clone());
    transport
        .wait_connected(config.connect_timeout())
        .await
        .with_context(|| format!("could not connect to {}", config.server_url))?;

    info!(
        component = "cli",
        event = "cli.connected",
        url = %config.server_url,
    );

    let ctx = StreamingContext::new(
        Arc::new(transport.clone()),
        router,
        Arc::new(config.catalog()),
    );
    transport.rejoin_on_reconnect(ctx.panels.clone());

    Ok(Session {
        ctx,
        config,
        character: overrides.character.clone(),
    })
}
