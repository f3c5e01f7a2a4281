//! In-memory transport for testing and single-process use
//!
//! `MemoryConnector` is a cheap handle (clone it, give one copy to the
//! client, keep one in the test). It records every connection attempt and
//! every frame written, and lets the holder steer the connection: keep it
//! in Connecting, refuse it, inject inbound frames, close it remotely.

use super::{ControlSocket, Connector};
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Gate {
    Pending,
    Open,
    Refused(String),
}

enum Inbound {
    Frame(String),
    Close,
}

struct Shared {
    gate: watch::Sender<Gate>,
    attempts: watch::Sender<Vec<String>>,
    sent: watch::Sender<Vec<String>>,
    send_failure: Mutex<Option<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
}

/// Fake connector backed by in-process channels
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    fn with_gate(gate: Gate) -> Self {
        Self {
            shared: Arc::new(Shared {
                gate: watch::Sender::new(gate),
                attempts: watch::Sender::new(Vec::new()),
                sent: watch::Sender::new(Vec::new()),
                send_failure: Mutex::new(None),
                inbound: Mutex::new(None),
            }),
        }
    }

    /// Connections open immediately
    pub fn new() -> Self {
        Self::with_gate(Gate::Open)
    }

    /// Connections stay in Connecting until [`open`](Self::open) or
    /// [`refuse`](Self::refuse) is called
    pub fn held() -> Self {
        Self::with_gate(Gate::Pending)
    }

    /// Every connection attempt fails with the given reason
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self::with_gate(Gate::Refused(reason.into()))
    }

    /// Let held connection attempts complete
    pub fn open(&self) {
        self.shared.gate.send_replace(Gate::Open);
    }

    /// Fail held (and future) connection attempts
    pub fn refuse(&self, reason: impl Into<String>) {
        self.shared.gate.send_replace(Gate::Refused(reason.into()));
    }

    /// Make every following write fail
    pub fn fail_sends(&self, reason: impl Into<String>) {
        if let Ok(mut failure) = self.shared.send_failure.lock() {
            *failure = Some(reason.into());
        }
    }

    /// Deliver a frame to the open socket; false when no socket exists
    pub fn push_inbound(&self, frame: impl Into<String>) -> bool {
        self.inbound_send(Inbound::Frame(frame.into()))
    }

    /// Close the open socket from the remote side
    pub fn close_remote(&self) -> bool {
        self.inbound_send(Inbound::Close)
    }

    fn inbound_send(&self, msg: Inbound) -> bool {
        match self.shared.inbound.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(msg).is_ok()),
            Err(_) => false,
        }
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> usize {
        self.shared.attempts.borrow().len()
    }

    /// URLs of all connection attempts, in order
    pub fn attempted_urls(&self) -> Vec<String> {
        self.shared.attempts.borrow().clone()
    }

    /// Every frame written, in write order
    pub fn sent(&self) -> Vec<String> {
        self.shared.sent.borrow().clone()
    }

    /// Written frames decoded as JSON
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    /// Wait until at least `count` frames have been written
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        let mut rx = self.shared.sent.subscribe();
        let sent = match rx.wait_for(|sent| sent.len() >= count).await {
            Ok(sent) => (*sent).clone(),
            Err(_) => self.sent(),
        };
        sent
    }

    /// Wait until at least `count` connection attempts have started
    pub async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.shared.attempts.subscribe();
        let _ = rx.wait_for(|attempts| attempts.len() >= count).await;
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ControlSocket>> {
        self.shared
            .attempts
            .send_modify(|attempts| attempts.push(url.to_string()));

        let mut gate = self.shared.gate.subscribe();
        let outcome = gate
            .wait_for(|g| *g != Gate::Pending)
            .await
            .map(|g| (*g).clone())
            .map_err(|_| ControlError::Connection("memory gate dropped".to_string()))?;

        if let Gate::Refused(reason) = outcome {
            return Err(ControlError::Connection(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inbound) = self.shared.inbound.lock() {
            *inbound = Some(tx);
        }

        Ok(Box::new(MemorySocket {
            shared: self.shared.clone(),
            inbound: rx,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemorySocket {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl ControlSocket for MemorySocket {
    async fn send(&mut self, frame: String) -> Result<()> {
        let failure = self
            .shared
            .send_failure
            .lock()
            .ok()
            .and_then(|f| f.clone());
        if let Some(reason) = failure {
            return Err(ControlError::Send(reason));
        }

        self.shared.sent.send_modify(|sent| sent.push(frame));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => Ok(Some(frame)),
            Some(Inbound::Close) | None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound.close();
        Ok(())
    }
}
