//! Page ↔ worker messages.
//!
//! Pages talk to the worker with JSON messages:
//!
//! ```text
//! {"type": "SKIP_WAITING"}                  → activate now
//! {"type": "GET_VERSION"} + reply port      → {"version": "<static cache name>"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::clients::ClientId;
use crate::ServiceWorkerError;

/// Tag the page registers for background sync.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Control messages understood by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SkipWaiting,
    GetVersion,
}

impl ClientMessage {
    /// Decode a message; `None` for anything the worker does not understand.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Reply to `GET_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

/// Sending half of a reply channel handed over with a message.
#[derive(Debug, Clone)]
pub struct ReplyPort {
    tx: mpsc::UnboundedSender<JsonValue>,
}

impl ReplyPort {
    /// Create a port and the receiver the page keeps.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JsonValue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post a message back to the page.
    pub fn post_message(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(data)
            .map_err(|_| ServiceWorkerError::Message("Reply port is closed".to_string()))
    }
}

/// A message event delivered to the worker.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Message payload.
    pub data: JsonValue,

    /// Transferred reply ports.
    pub ports: Vec<ReplyPort>,

    /// Sending client.
    pub source: Option<ClientId>,
}

impl MessageEvent {
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            ports: Vec::new(),
            source: None,
        }
    }

    /// Attach a reply port.
    pub fn with_port(mut self, port: ReplyPort) -> Self {
        self.ports.push(port);
        self
    }
}

/// What handling a message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The worker asked to skip waiting.
    SkipWaiting,
    /// A version reply was posted.
    VersionSent(String),
    /// Unknown, malformed or unanswerable message.
    Ignored,
}
