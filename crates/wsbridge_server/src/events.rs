//! Lifecycle events, inbound commands and the event sink boundary.
//!
//! Every event the server emits is a [`ServerEvent`] variant. Events are
//! serialized only at the sink boundary, as JSON objects discriminated by an
//! `action` field:
//!
//! ```json
//! {"action":"onOpen","conn":{"uuid":"…","remoteAddr":"127.0.0.1","acceptedProtocol":"","httpFields":{},"resource":"/chat"}}
//! {"action":"onMessage","uuid":"…","msg":"hello"}
//! {"action":"onClose","uuid":"…","code":1000,"reason":"","wasClean":true}
//! {"action":"onFailure","addr":"0.0.0.0","port":8080,"reason":"…"}
//! ```

use crate::error::SinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::error;

/// Close code sentinel meaning "use the normal closure code".
pub const DEFAULT_CLOSE_CODE: i32 = -1;

/// Connection description carried by `onOpen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub uuid: String,
    pub remote_addr: String,
    /// Empty when no subprotocol was negotiated
    pub accepted_protocol: String,
    pub http_fields: BTreeMap<String, String>,
    pub resource: String,
}

/// Events delivered to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ServerEvent {
    #[serde(rename = "onOpen")]
    Open { conn: ConnectionInfo },

    #[serde(rename = "onMessage")]
    Message { uuid: String, msg: String },

    #[serde(rename = "onClose")]
    Close {
        uuid: String,
        code: u16,
        reason: String,
        #[serde(rename = "wasClean")]
        was_clean: bool,
    },

    #[serde(rename = "onFailure")]
    Failure {
        addr: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerEvent {
    /// The `action` discriminator of this event.
    pub fn action(&self) -> &'static str {
        match self {
            ServerEvent::Open { .. } => "onOpen",
            ServerEvent::Message { .. } => "onMessage",
            ServerEvent::Close { .. } => "onClose",
            ServerEvent::Failure { .. } => "onFailure",
        }
    }

    /// Encodes the event as a single-line JSON object.
    pub fn to_json(&self) -> Result<String, SinkError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How the sink should treat the channel after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// More events will follow on the same channel
    KeepListening,
    /// Last event; the server will not emit again
    Final,
}

/// Consumer of server lifecycle events.
///
/// Implementations must be cheap to call from many connection tasks at once.
/// `emit` is never called while the server holds its state lock, so a sink
/// may issue commands back into the server.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    async fn emit(&self, event: ServerEvent, delivery: Delivery) -> Result<(), SinkError>;

    /// Reports a failed emission through the sink's error channel.
    async fn report_error(&self, error: SinkError) {
        error!("❌ Event sink error: {}", error);
    }
}

/// Sink forwarding events into a tokio channel.
///
/// Useful for embedding the server in another async application.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<(ServerEvent, Delivery)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ServerEvent, Delivery)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ServerEvent, delivery: Delivery) -> Result<(), SinkError> {
        self.sender.send((event, delivery)).map_err(|e| {
            let (event, _) = e.0;
            SinkError::Closed(format!("receiver dropped with {} pending", event.action()))
        })
    }
}

fn default_close_code() -> i32 {
    DEFAULT_CLOSE_CODE
}

/// Commands accepted from the event sink side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    /// Send a text message to one connection
    Send { uuid: String, msg: String },

    /// Close one connection; `code` of -1 (or omitted) uses 1000
    Close {
        uuid: String,
        #[serde(default = "default_close_code")]
        code: i32,
        #[serde(default)]
        reason: String,
    },

    /// Stop accepting and close every connection
    Stop,
}

impl Command {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
