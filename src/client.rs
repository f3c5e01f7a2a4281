//! Control client: owns the connection to the worker control endpoint
//!
//! `ControlClient` turns fire-and-forget `dispatch` calls into ordered
//! frames on a single lazily-created connection:
//!
//! - The first dispatch moves the connection from `Idle` to `Connecting`
//!   and spawns the connection task.
//! - Commands go into one bounded FIFO queue regardless of state. While
//!   Connecting they wait there; once Open the task drains the queue in
//!   submission order, then keeps writing new commands as they arrive.
//! - On connect failure, write failure, or remote close the connection
//!   becomes `Closed` for good. Whatever is still queued is handed to the
//!   dead letter queue, and later dispatches are dead-lettered directly.
//!   There is no automatic reconnect.

use crate::config::ControlConfig;
use crate::dlq::{DeadLetter, DlqHandler, FailureReason, MemoryDlqHandler};
use crate::error::{ControlError, Result};
use crate::schema;
use crate::transport::{ControlSocket, Connector};
use crate::types::{Envelope, MessageKind};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

/// Lifecycle of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket has been requested yet
    Idle,
    /// Socket requested, handshake in progress
    Connecting,
    /// Ready; queued commands are being written
    Open,
    /// Terminal: failed, closed remotely, or shut down
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Slot {
    Idle,
    Active(Outbound),
    Finished,
}

struct Outbound {
    queue: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

/// Connection manager for the worker control channel
///
/// Create one per process at startup and share it (behind an `Arc`) with
/// every command handler.
pub struct ControlClient {
    config: ControlConfig,
    connector: Arc<dyn Connector>,
    dlq: Arc<dyn DlqHandler>,
    slot: Mutex<Slot>,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: broadcast::Sender<Envelope>,
    in_flight: InFlight,
}

impl ControlClient {
    /// Create a client; no connection is made until the first dispatch
    pub fn new(config: ControlConfig, connector: impl Connector + 'static) -> Self {
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            config,
            connector: Arc::new(connector),
            dlq: Arc::new(MemoryDlqHandler::default()),
            slot: Mutex::new(Slot::Idle),
            state: Arc::new(state),
            inbound,
            in_flight: InFlight::default(),
        }
    }

    /// Replace the default in-memory dead letter handler
    pub fn with_dlq(mut self, dlq: impl DlqHandler + 'static) -> Self {
        self.dlq = Arc::new(dlq);
        self
    }

    /// Send a command to the worker
    ///
    /// Builds `{type: "command", id, payload: {action, ...fields}}` and
    /// queues it. Returns once the command is accepted or dead-lettered;
    /// it never waits for the connection to open and says nothing about
    /// delivery. The only error is a missing or invalid endpoint, checked
    /// before any connection attempt.
    pub async fn dispatch(&self, action: &str, fields: Map<String, Value>) -> Result<()> {
        let url = self.config.endpoint()?;
        self.enqueue(url, Envelope::command(action, fields)).await
    }

    /// Send a pre-built envelope (e.g. one targeting a specific worker)
    ///
    /// The envelope is run through the validator before it is queued. A
    /// `command` must carry a string `payload.action` and gets a fresh id
    /// when it has none. A caller-supplied id must not match any envelope
    /// that is still queued or being written; such a duplicate is refused
    /// with `Validation` and nothing is sent.
    pub async fn dispatch_envelope(&self, envelope: Envelope) -> Result<()> {
        let url = self.config.endpoint()?;
        schema::check(&serde_json::to_value(&envelope)?)
            .map_err(|rule| ControlError::Validation(rule.to_string()))?;

        let envelope = if envelope.kind() == MessageKind::Command {
            if envelope.action().is_none() {
                return Err(ControlError::Validation(
                    "command payload has no string 'action'".to_string(),
                ));
            }
            if envelope.id().is_some() {
                envelope
            } else {
                envelope.with_id(uuid::Uuid::new_v4().to_string())
            }
        } else {
            envelope
        };

        self.enqueue(url, envelope).await
    }

    async fn enqueue(&self, url: Url, envelope: Envelope) -> Result<()> {
        if let Some(id) = envelope.id() {
            if !self.in_flight.claim(id) {
                return Err(ControlError::Validation(format!(
                    "id '{}' is already in flight",
                    id
                )));
            }
        }

        let mut slot = self.slot.lock().await;
        if matches!(*slot, Slot::Idle) {
            *slot = Slot::Active(self.open(url));
        }

        let id = envelope.id().map(str::to_owned);
        let rejected = match &*slot {
            Slot::Active(outbound) => match outbound.queue.try_send(envelope) {
                Ok(()) => None,
                Err(TrySendError::Full(envelope)) => Some((envelope, FailureReason::QueueFull)),
                Err(TrySendError::Closed(envelope)) => {
                    Some((envelope, FailureReason::ConnectionClosed))
                }
            },
            Slot::Idle | Slot::Finished => Some((envelope, FailureReason::ConnectionClosed)),
        };
        drop(slot);

        match rejected {
            None => tracing::debug!(id = ?id, state = %self.state(), "Command queued"),
            Some((envelope, reason)) => {
                self.in_flight.release(envelope.id());
                dead_letter(self.dlq.as_ref(), envelope, reason).await
            }
        }
        Ok(())
    }

    fn open(&self, url: Url) -> Outbound {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));

        self.state.send_replace(ConnectionState::Connecting);
        tracing::info!(
            url = %url,
            transport = self.connector.name(),
            "Opening worker control connection"
        );

        let task = ConnectionTask {
            url,
            connector: self.connector.clone(),
            connect_timeout: self.config.connect_timeout(),
            queue: queue_rx,
            dlq: self.dlq.clone(),
            state: self.state.clone(),
            inbound: self.inbound.clone(),
            in_flight: self.in_flight.clone(),
        };

        Outbound {
            queue: queue_tx,
            task: tokio::spawn(task.run()),
        }
    }

    /// Stop accepting commands, flush the queue and close the connection
    ///
    /// Waits for a pending connection attempt to resolve first, so without
    /// `connect_timeout_ms` this can wait as long as the transport does.
    /// Commands dispatched afterwards are dead-lettered.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock().await, Slot::Finished);
        match previous {
            Slot::Active(Outbound { queue, task }) => {
                drop(queue);
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "Control connection task failed");
                }
            }
            Slot::Idle => {
                self.state.send_replace(ConnectionState::Closed);
            }
            Slot::Finished => {}
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receive inbound envelopes that passed validation
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    /// Dead letter handler in use
    pub fn dlq(&self) -> Arc<dyn DlqHandler> {
        self.dlq.clone()
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &str {
        self.connector.name()
    }
}

/// Ids of envelopes accepted but not yet written or dead-lettered
#[derive(Clone, Default)]
struct InFlight(Arc<std::sync::Mutex<HashSet<String>>>);

impl InFlight {
    /// False when the id is already taken
    fn claim(&self, id: &str) -> bool {
        match self.0.lock() {
            Ok(mut ids) => ids.insert(id.to_owned()),
            Err(poisoned) => poisoned.into_inner().insert(id.to_owned()),
        }
    }

    fn release(&self, id: Option<&str>) {
        let Some(id) = id else { return };
        match self.0.lock() {
            Ok(mut ids) => ids.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        };
    }
}

async fn dead_letter(dlq: &dyn DlqHandler, envelope: Envelope, reason: FailureReason) {
    if let Err(e) = dlq.handle(DeadLetter::new(envelope, reason)).await {
        tracing::error!(error = %e, "Failed to record dead letter");
    }
}

async fn connect(
    connector: &dyn Connector,
    url: &Url,
    timeout: Option<Duration>,
) -> std::result::Result<Box<dyn ControlSocket>, FailureReason> {
    let attempt = connector.connect(url);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    url = %url,
                    timeout_ms = limit.as_millis() as u64,
                    "Worker control connection timed out"
                );
                return Err(FailureReason::ConnectTimeout);
            }
        },
        None => attempt.await,
    };

    result.map_err(|e| {
        tracing::warn!(url = %url, error = %e, "Worker control connection failed");
        FailureReason::ConnectFailed(e.to_string())
    })
}

/// Background task owning the socket for one connection lifetime
struct ConnectionTask {
    url: Url,
    connector: Arc<dyn Connector>,
    connect_timeout: Option<Duration>,
    queue: mpsc::Receiver<Envelope>,
    dlq: Arc<dyn DlqHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: broadcast::Sender<Envelope>,
    in_flight: InFlight,
}

impl ConnectionTask {
    async fn run(mut self) {
        let connected = connect(self.connector.as_ref(), &self.url, self.connect_timeout).await;

        let mut socket = match connected {
            Ok(socket) => socket,
            Err(reason) => {
                self.abandon(reason).await;
                return;
            }
        };

        self.state.send_replace(ConnectionState::Open);
        tracing::info!(url = %self.url, "Worker control connection open");

        let reason = loop {
            tokio::select! {
                next = self.queue.recv() => match next {
                    Some(envelope) => {
                        let id = envelope.id().map(str::to_owned);
                        let written = self.write(socket.as_mut(), envelope).await;
                        self.in_flight.release(id.as_deref());
                        if !written {
                            break FailureReason::ConnectionClosed;
                        }
                    }
                    None => {
                        // Every sender is gone and the queue is drained
                        if let Err(e) = socket.close().await {
                            tracing::debug!(error = %e, "Error closing control connection");
                        }
                        self.state.send_replace(ConnectionState::Closed);
                        tracing::info!(url = %self.url, "Worker control connection shut down");
                        return;
                    }
                },
                frame = socket.recv() => match frame {
                    Ok(Some(text)) => self.accept_inbound(&text),
                    Ok(None) => {
                        tracing::info!(url = %self.url, "Worker control endpoint closed the connection");
                        break FailureReason::ConnectionClosed;
                    }
                    Err(e) => {
                        tracing::warn!(url = %self.url, error = %e, "Worker control connection error");
                        break FailureReason::ConnectionClosed;
                    }
                },
            }
        };

        if let Err(e) = socket.close().await {
            tracing::debug!(error = %e, "Error closing control connection");
        }
        self.abandon(reason).await;
    }

    /// Write one envelope; false when the connection must be abandoned
    async fn write(&self, socket: &mut dyn ControlSocket, envelope: Envelope) -> bool {
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                dead_letter(self.dlq.as_ref(), envelope, FailureReason::SendFailed(e.to_string()))
                    .await;
                return true;
            }
        };

        match socket.send(frame).await {
            Ok(()) => {
                tracing::debug!(
                    id = envelope.id().unwrap_or("-"),
                    kind = %envelope.kind(),
                    action = envelope.action().unwrap_or("-"),
                    "Control message sent"
                );
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Failed to write control message");
                dead_letter(self.dlq.as_ref(), envelope, FailureReason::SendFailed(e.to_string()))
                    .await;
                false
            }
        }
    }

    fn accept_inbound(&self, text: &str) {
        match schema::parse_envelope(text) {
            Ok(envelope) => {
                tracing::debug!(
                    kind = %envelope.kind(),
                    id = envelope.id().unwrap_or("-"),
                    "Inbound control message"
                );
                // No subscribers is fine; inbound traffic is optional
                let _ = self.inbound.send(envelope);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding invalid inbound control message");
            }
        }
    }

    /// Close the queue and dead-letter everything still in it
    ///
    /// The state flips to Closed only after the queue is drained, so an
    /// observer that sees Closed also sees every lost command in the DLQ.
    async fn abandon(&mut self, reason: FailureReason) {
        self.queue.close();

        let mut lost = 0usize;
        while let Some(envelope) = self.queue.recv().await {
            self.in_flight.release(envelope.id());
            dead_letter(self.dlq.as_ref(), envelope, reason.clone()).await;
            lost += 1;
        }

        self.state.send_replace(ConnectionState::Closed);
        tracing::warn!(
            url = %self.url,
            reason = %reason,
            lost,
            "Worker control connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn client(connector: &MemoryConnector) -> ControlClient {
        ControlClient::new(
            ControlConfig::with_url("ws://127.0.0.1:8787"),
            connector.clone(),
        )
    }

    async fn wait_state(client: &ControlClient, target: ConnectionState) {
        let mut rx = client.watch_state();
        rx.wait_for(|s| *s == target).await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(client.transport_name(), "memory");
        assert_eq!(client.config().url.as_deref(), Some("ws://127.0.0.1:8787"));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_url_fails_without_connecting() {
        let connector = MemoryConnector::new();
        let client = ControlClient::new(ControlConfig::default(), connector.clone());

        let err = client.dispatch("skip", Map::new()).await.unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));

        tokio::task::yield_now().await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_first_dispatch_connects_once() {
        let connector = MemoryConnector::new();
        let client = client(&connector);

        client.dispatch("play", fields(json!({"query": "song"}))).await.unwrap();
        client.dispatch("skip", Map::new()).await.unwrap();
        connector.wait_for_sent(2).await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_dispatch_while_connecting_is_deferred() {
        let connector = MemoryConnector::held();
        let client = client(&connector);

        client.dispatch("skip", Map::new()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        connector.wait_for_attempts(1).await;
        assert!(connector.sent().is_empty());

        connector.open();
        let sent = connector.wait_for_sent(1).await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_is_dead_lettered() {
        let connector = MemoryConnector::held();
        let mut config = ControlConfig::with_url("ws://127.0.0.1:8787");
        config.queue_capacity = 1;
        let client = ControlClient::new(config, connector.clone());

        client.dispatch("play", Map::new()).await.unwrap();
        client.dispatch("skip", Map::new()).await.unwrap();

        let letters = client.dlq().list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, FailureReason::QueueFull);
        assert_eq!(letters[0].envelope.action(), Some("skip"));

        connector.open();
        let sent = connector.wait_for_sent(1).await;
        assert!(sent[0].contains("\"play\""));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = MemoryConnector::held();
        let mut config = ControlConfig::with_url("ws://127.0.0.1:8787");
        config.connect_timeout_ms = Some(20);
        let client = ControlClient::new(config, connector.clone());

        client.dispatch("stop", Map::new()).await.unwrap();
        wait_state(&client, ConnectionState::Closed).await;

        let letters = client.dlq().list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, FailureReason::ConnectTimeout);
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_closes_connection() {
        let connector = MemoryConnector::new();
        let client = client(&connector);

        client.dispatch("play", Map::new()).await.unwrap();
        connector.wait_for_sent(1).await;

        connector.fail_sends("broken pipe");
        client.dispatch("skip", Map::new()).await.unwrap();
        wait_state(&client, ConnectionState::Closed).await;

        let letters = client.dlq().list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(
            letters[0].reason,
            FailureReason::SendFailed("Send error: broken pipe".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_inbound_is_discarded() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut inbound = client.subscribe();

        client.dispatch("status", Map::new()).await.unwrap();
        wait_state(&client, ConnectionState::Open).await;

        assert!(connector.push_inbound("not json"));
        assert!(connector.push_inbound(r#"{"type":"bogus"}"#));
        assert!(connector.push_inbound(r#"{"type":"command","id":5}"#));
        assert!(connector.push_inbound(r#"{"type":"assign_id","workerId":"w-1"}"#));

        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.kind(), MessageKind::AssignId);
        assert_eq!(envelope.worker_id(), Some("w-1"));
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_shutdown_pending_until_connected() {
        let connector = MemoryConnector::held();
        let client = client(&connector);

        client.dispatch("play", Map::new()).await.unwrap();
        connector.wait_for_attempts(1).await;

        let mut shutdown = tokio_test::task::spawn(client.shutdown());
        tokio_test::assert_pending!(shutdown.poll());

        connector.open();
        connector.wait_for_sent(1).await;
        wait_state(&client, ConnectionState::Closed).await;
        tokio_test::assert_ready!(shutdown.poll());
        assert_eq!(client.dlq().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_dispatch() {
        let connector = MemoryConnector::new();
        let client = client(&connector);

        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        client.dispatch("skip", Map::new()).await.unwrap();
        assert_eq!(connector.attempts(), 0);
        assert_eq!(client.dlq().count().await.unwrap(), 1);
    }
}
