//! # worker-control
//!
//! Control-channel protocol and connection manager for forwarding
//! playback commands from a chat bot to its long-running worker processes.
//!
//! ## Overview
//!
//! Command handlers call [`ControlClient::dispatch`] with an action name and
//! a few fields. The client wraps them in an [`Envelope`], opens the
//! connection to the worker control endpoint on first use, and writes the
//! envelopes in call order, including the ones issued while the connection
//! was still being established. Anything that cannot be delivered ends up in
//! the dead letter queue instead of disappearing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use worker_control::{ControlClient, ControlConfig, WebSocketConnector};
//!
//! # async fn example() -> worker_control::Result<()> {
//! let config = ControlConfig::from_env()?;
//! let client = ControlClient::new(config, WebSocketConnector::new());
//!
//! let mut fields = serde_json::Map::new();
//! fields.insert("guildId".into(), "123".into());
//! client.dispatch("skip", fields).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Receiving side
//!
//! Anything read from the channel must pass [`validate`] (or
//! [`parse_envelope`]) before its `type` or `payload` is trusted.
//!
//! ## Architecture
//!
//! - **MessageKind / Envelope**: the closed message schema
//! - **validate**: shape check used at every trust boundary
//! - **ControlClient**: lazy connection, bounded FIFO queue, state machine
//! - **Connector / ControlSocket**: transport abstraction (WebSocket, memory)
//! - **DlqHandler**: explicit record of every command that was not sent

pub mod client;
pub mod config;
pub mod dlq;
pub mod error;
pub mod schema;
pub mod transport;
pub mod types;

// Re-export core types
pub use client::{ConnectionState, ControlClient};
pub use config::ControlConfig;
pub use dlq::{DeadLetter, DlqHandler, FailureReason, MemoryDlqHandler};
pub use error::{ControlError, Result};
pub use schema::{parse_envelope, validate};
pub use transport::{ControlSocket, Connector};
pub use types::{Envelope, MessageKind, UnknownKind};

// Re-export transports for convenience
pub use transport::memory::MemoryConnector;
pub use transport::websocket::WebSocketConnector;
