//! WebSocket transport
//!
//! Text frames carry one JSON envelope each. Pings, pongs and binary
//! frames are not part of the protocol and are skipped.

use super::{ControlSocket, Connector};
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Stream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connector for `ws://` / `wss://` control endpoints
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ControlSocket>> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ControlError::Connection(format!("{}: {}", url, e)))?;

        tracing::info!(url = %url, "Connected to worker control endpoint");

        Ok(Box::new(WebSocketSocket { stream }))
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// An open WebSocket control connection
pub struct WebSocketSocket {
    stream: Stream,
}

#[async_trait]
impl ControlSocket for WebSocketSocket {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ControlError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(frame = ?frame, "Control endpoint sent close frame");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ControlError::Connection(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ControlError::Connection(e.to_string()))
    }
}
