//! WebSocket [`Transport`] implementation.
//!
//! A supervisor task owns the socket: it forwards outbound frames, answers
//! pings, resolves pending request acks, dispatches conversation events to
//! the router and reconnects with exponential backoff. Callers talk to it
//! through an mpsc channel and observe connectivity through a `watch`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colloquy_protocol::{new_id, ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::panel::PanelRegistry;
use crate::router::ConversationEventRouter;
use crate::transport::{
    CreateConversation, InvokeTool, RequestAccepted, SendMessage, StartMultiCharacter, Transport,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepted-request payload carried by an ack
#[derive(Debug, Clone, Default)]
struct Ack {
    conversation_id: Option<String>,
    tracking_id: Option<String>,
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Ack, TransportError>>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted or transport shut down
    Disconnected,
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

struct Supervisor {
    config: ClientConfig,
    router: ConversationEventRouter,
    outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    pending: PendingAcks,
    state_tx: watch::Sender<ConnectionState>,
}

/// Handle to the WebSocket connection (cheap to Clone).
#[derive(Clone)]
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingAcks,
    state_rx: watch::Receiver<ConnectionState>,
    request_timeout: Duration,
}

impl WsTransport {
    /// Start the supervisor task. Connection happens in the background; use
    /// [`wait_connected`](Self::wait_connected) to await it.
    pub fn spawn(config: ClientConfig, router: ConversationEventRouter) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let request_timeout = config.request_timeout();

        let supervisor = Supervisor {
            config,
            router,
            outbound_rx,
            pending: pending.clone(),
            state_tx,
        };
        tokio::spawn(supervisor.run());

        Self {
            outbound,
            pending,
            state_rx,
            request_timeout,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until connected. Fails fast once the supervisor has given up.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            rx.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Disconnected
                )
            })
            .await
            .map(|state| *state == ConnectionState::Connected)
        };
        let connected = tokio::time::timeout(timeout, wait).await;
        match connected {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Keep panel routing alive across reconnects: mappings are marked
    /// unjoined on disconnect and re-sent once the socket is back.
    pub fn rejoin_on_reconnect(&self, panels: PanelRegistry) -> JoinHandle<()> {
        let mut rx = self.state_rx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        let joined = panels.rejoin_all().await;
                        if joined > 0 {
                            info!(
                                component = "ws_transport",
                                event = "ws.panels.rejoined",
                                count = joined,
                            );
                        }
                    }
                    ConnectionState::Disconnected => {
                        panels.mark_all_unjoined();
                        return;
                    }
                    _ => panels.mark_all_unjoined(),
                }
            }
        })
    }

    async fn request(&self, message: ClientMessage) -> Result<Ack, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let request_id = message
            .request_id()
            .map(String::from)
            .ok_or_else(|| TransportError::Serialization("request without request_id".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if self.outbound.send(message).is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(TransportError::ChannelClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::ChannelClosed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(
                    component = "ws_transport",
                    event = "ws.request.timeout",
                    request_id = %request_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                );
                Err(TransportError::Timeout)
            }
        }
    }

    fn send_unacked(&self, message: ClientMessage) {
        if !self.is_connected() {
            debug!(
                component = "ws_transport",
                event = "ws.send.skipped_offline",
                request = ?message,
            );
            return;
        }
        let _ = self.outbound.send(message);
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    async fn create_conversation(
        &self,
        request: CreateConversation,
    ) -> Result<String, TransportError> {
        let ack = self
            .request(ClientMessage::CreateConversation {
                request_id: new_id(),
                character_id: request.character_id,
                panel_id: request.panel_id,
                metadata: request.metadata,
            })
            .await?;
        ack.conversation_id
            .ok_or_else(|| TransportError::Rejected("ack carried no conversation_id".into()))
    }

    async fn invoke_tool(&self, request: InvokeTool) -> Result<RequestAccepted, TransportError> {
        let ack = self
            .request(ClientMessage::InvokeTool {
                request_id: new_id(),
                conversation_id: request.conversation_id,
                character_id: request.character_id,
                tool_name: request.tool_name,
                arguments: request.arguments,
            })
            .await?;
        Ok(RequestAccepted {
            tracking_id: ack.tracking_id,
        })
    }

    async fn send_message(&self, request: SendMessage) -> Result<RequestAccepted, TransportError> {
        let ack = self
            .request(ClientMessage::SendMessage {
                request_id: new_id(),
                conversation_id: request.conversation_id,
                character_id: request.character_id,
                content: request.content,
            })
            .await?;
        Ok(RequestAccepted {
            tracking_id: ack.tracking_id,
        })
    }

    async fn start_multi_character(
        &self,
        request: StartMultiCharacter,
    ) -> Result<RequestAccepted, TransportError> {
        let ack = self
            .request(ClientMessage::StartMultiCharacter {
                request_id: new_id(),
                conversation_id: request.conversation_id,
                characters: request.characters,
                mode: request.mode,
                content: request.content,
            })
            .await?;
        Ok(RequestAccepted {
            tracking_id: ack.tracking_id,
        })
    }

    fn cancel_request(&self, conversation_id: &str) {
        self.send_unacked(ClientMessage::CancelRequest {
            conversation_id: conversation_id.to_string(),
        });
    }

    async fn join_panel(&self, panel_id: &str, conversation_id: &str) -> Result<(), TransportError> {
        self.request(ClientMessage::JoinPanel {
            request_id: new_id(),
            panel_id: panel_id.to_string(),
            conversation_id: conversation_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    fn leave_panel(&self, panel_id: &str) {
        self.send_unacked(ClientMessage::LeavePanel {
            panel_id: panel_id.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.state_tx.send_replace(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            let connect = tokio_tungstenite::connect_async(self.config.server_url.as_str());
            match tokio::time::timeout(self.config.connect_timeout(), connect).await {
                Ok(Ok((stream, _response))) => {
                    info!(
                        component = "ws_transport",
                        event = "ws.connected",
                        url = %self.config.server_url,
                        attempt = attempt,
                    );
                    attempt = 0;
                    self.state_tx.send_replace(ConnectionState::Connected);

                    match self.session(stream).await {
                        SessionEnd::Shutdown => {
                            self.shutdown("transport dropped").await;
                            return;
                        }
                        SessionEnd::Closed(reason) => {
                            warn!(
                                component = "ws_transport",
                                event = "ws.disconnected",
                                reason = %reason,
                            );
                            self.state_tx
                                .send_replace(ConnectionState::Reconnecting { attempt: 1 });
                            self.on_connection_lost(&reason).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        component = "ws_transport",
                        event = "ws.connect.failed",
                        url = %self.config.server_url,
                        attempt = attempt,
                        error = %e,
                    );
                }
                Err(_) => {
                    warn!(
                        component = "ws_transport",
                        event = "ws.connect.timeout",
                        url = %self.config.server_url,
                        attempt = attempt,
                    );
                }
            }

            if attempt >= self.config.reconnect_max_attempts {
                error!(
                    component = "ws_transport",
                    event = "ws.reconnect.exhausted",
                    attempts = attempt,
                    "Giving up on server connection"
                );
                self.shutdown("reconnect attempts exhausted").await;
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            attempt += 1;
            debug!(
                component = "ws_transport",
                event = "ws.reconnect.scheduled",
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
            );
            if !self.backoff(delay).await {
                self.shutdown("transport dropped").await;
                return;
            }
        }
    }

    /// Sleep for `delay`, discarding anything queued meanwhile. Returns
    /// false if every transport handle was dropped.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                queued = self.outbound_rx.recv() => match queued {
                    Some(message) => self.reject(&message, TransportError::NotConnected).await,
                    None => return false,
                },
            }
        }
    }

    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    let Some(message) = outbound else {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            self.reject(&message, e.into()).await;
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        self.reject(&message, TransportError::WebSocket(e.to_string())).await;
                        return SessionEnd::Closed(e.to_string());
                    }
                }

                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return SessionEnd::Closed(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    component = "ws_transport",
                    event = "ws.inbound.parse_error",
                    error = %e,
                    payload_len = text.len(),
                );
                return;
            }
        };

        if let ServerMessage::Ack {
            request_id,
            conversation_id,
            tracking_id,
            error,
        } = message
        {
            let result = match error {
                Some(reason) => Err(TransportError::Rejected(reason)),
                None => Ok(Ack {
                    conversation_id,
                    tracking_id,
                }),
            };
            match self.pending.lock().await.remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(
                    component = "ws_transport",
                    event = "ws.ack.orphaned",
                    request_id = %request_id,
                ),
            }
            return;
        }

        self.router.dispatch(&message);
    }

    async fn reject(&self, message: &ClientMessage, error: TransportError) {
        if let Some(request_id) = message.request_id() {
            if let Some(tx) = self.pending.lock().await.remove(request_id) {
                let _ = tx.send(Err(error));
            }
        }
    }

    async fn fail_pending(&self, error: TransportError) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(
                component = "ws_transport",
                event = "ws.pending.failed",
                count = drained.len(),
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    async fn on_connection_lost(&mut self, reason: &str) {
        self.fail_pending(TransportError::WebSocket(reason.to_string()))
            .await;
        while let Ok(message) = self.outbound_rx.try_recv() {
            self.reject(&message, TransportError::NotConnected).await;
        }
        self.router.dispatch(&ServerMessage::Error {
            conversation_id: None,
            character_id: None,
            message: format!("Connection lost: {reason}"),
        });
    }

    async fn shutdown(&self, reason: &str) {
        info!(
            component = "ws_transport",
            event = "ws.shutdown",
            reason = %reason,
        );
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.fail_pending(TransportError::NotConnected).await;
    }
}
