//! Dead Letter Queue: commands that were accepted but never written
//!
//! Every envelope handed to `dispatch` ends up either on the socket or
//! here, exactly once. Nothing is dropped silently when the connection
//! fails, closes, or the outbound queue overflows.

use crate::error::Result;
use crate::types::Envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why a command never reached the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The connection attempt failed before reaching Open
    ConnectFailed(String),
    /// The connection did not reach Open within the configured timeout
    ConnectTimeout,
    /// Writing the frame failed; the connection was abandoned
    SendFailed(String),
    /// The connection closed (remotely, on error, or on shutdown)
    ConnectionClosed,
    /// The outbound queue was at capacity
    QueueFull,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            FailureReason::ConnectTimeout => f.write_str("connect timed out"),
            FailureReason::SendFailed(e) => write!(f, "send failed: {}", e),
            FailureReason::ConnectionClosed => f.write_str("connection closed"),
            FailureReason::QueueFull => f.write_str("outbound queue full"),
        }
    }
}

/// A command that failed dispatch, with context
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The envelope that was never transmitted
    pub envelope: Envelope,

    pub reason: FailureReason,

    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: Envelope, reason: FailureReason) -> Self {
        Self {
            envelope,
            reason,
            failed_at: Utc::now(),
        }
    }
}

/// Trait for dead letter handlers
///
/// Implementations decide what to do with commands that could not be
/// delivered: log, store, surface to the issuing command handler, alert.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered command
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ handler
///
/// Keeps at most `max_letters` entries; the oldest are dropped first.
/// A `max_letters` of zero means unbounded.
pub struct MemoryDlqHandler {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            id = letter.envelope.id().unwrap_or("-"),
            action = letter.envelope.action().unwrap_or("-"),
            reason = %letter.reason,
            "Command dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
