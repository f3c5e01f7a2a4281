//! Error types for worker-control

use thiserror::Error;

/// Errors that can occur on the control channel
#[derive(Debug, Error)]
pub enum ControlError {
    /// Missing or malformed configuration (fatal for dispatching components)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection to the worker control endpoint failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Writing a frame to the socket failed
    #[error("Send error: {0}")]
    Send(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message failed the envelope validation contract
    #[error("Invalid control message: {0}")]
    Validation(String),
}

/// Result type alias for control-channel operations
pub type Result<T> = std::result::Result<T, ControlError>;
