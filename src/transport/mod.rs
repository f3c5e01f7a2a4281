//! Transport traits: the streaming-socket abstraction under the client
//!
//! A `Connector` opens one message-framed, bidirectional connection to the
//! worker control endpoint. The `ControlClient` owns the resulting
//! `ControlSocket` exclusively; no other component touches it.

use crate::error::Result;
use async_trait::async_trait;
use url::Url;

pub mod memory;
pub mod websocket;

/// Opens connections to a control endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the handshake
    ///
    /// Resolves when the connection is open, or fails. The client treats
    /// the time spent here as the Connecting state.
    async fn connect(&self, url: &Url) -> Result<Box<dyn ControlSocket>>;

    /// Transport name (e.g., "websocket", "memory")
    fn name(&self) -> &str;
}

/// An open, message-framed connection
#[async_trait]
pub trait ControlSocket: Send {
    /// Write one text frame
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound text frame; `Ok(None)` once the peer has closed
    ///
    /// Must be cancel-safe: the client races it against outbound writes.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Close the connection from our side
    async fn close(&mut self) -> Result<()>;
}
