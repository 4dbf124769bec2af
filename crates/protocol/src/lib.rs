//! Colloquy Protocol
//!
//! Wire types exchanged between Colloquy clients and the AI conversation
//! server, sent as tagged JSON text frames over one WebSocket.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Fresh `request_id` for correlating a request with its ack
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
