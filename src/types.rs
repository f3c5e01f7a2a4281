//! Core message types for the control channel
//!
//! All types use camelCase JSON serialization for wire compatibility
//! with the worker processes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Closed set of message kinds recognized by the control protocol
///
/// Adding a kind is a protocol change: every `match` over this enum has
/// to handle it, and the validator picks it up through [`MessageKind::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Instruction for a worker (payload carries `action`)
    Command,
    /// Worker announcing itself on the channel
    Register,
    /// Control side handing a worker its identifier
    AssignId,
    /// Worker-originated notification (e.g. session released)
    Event,
    /// Reply correlated to an earlier envelope by `id`
    Response,
}

impl MessageKind {
    /// Every kind, in declaration order
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Command,
        MessageKind::Register,
        MessageKind::AssignId,
        MessageKind::Event,
        MessageKind::Response,
    ];

    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Register => "register",
            MessageKind::AssignId => "assign_id",
            MessageKind::Event => "event",
            MessageKind::Response => "response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a member of [`MessageKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// The unit exchanged over the control channel
///
/// Envelopes are built once and never mutated after dispatch; fields are
/// only reachable through accessors. Optional fields are omitted from the
/// wire form when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Map<String, Value>>,
}

impl Envelope {
    /// Create a bare envelope of the given kind
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            worker_id: None,
            payload: None,
        }
    }

    /// Create a command envelope with a fresh correlation id
    ///
    /// The payload is `{action, ...fields}`. An `action` key inside
    /// `fields` is discarded; the explicit `action` argument is the one
    /// that goes on the wire.
    pub fn command(action: impl Into<String>, fields: Map<String, Value>) -> Self {
        let action = action.into();
        let mut payload = Map::with_capacity(fields.len() + 1);
        payload.insert("action".to_string(), Value::String(action.clone()));
        for (key, value) in fields {
            if key == "action" {
                tracing::debug!(%action, "Ignoring 'action' key in command fields");
                continue;
            }
            payload.insert(key, value);
        }

        Self {
            kind: MessageKind::Command,
            id: Some(uuid::Uuid::new_v4().to_string()),
            worker_id: None,
            payload: Some(payload),
        }
    }

    /// Set the correlation id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Target a specific worker instance
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attach a payload object
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn payload(&self) -> Option<&Map<String, Value>> {
        self.payload.as_ref()
    }

    /// The `action` field of a command payload, if present and a string
    pub fn action(&self) -> Option<&str> {
        self.payload.as_ref()?.get("action")?.as_str()
    }
}
