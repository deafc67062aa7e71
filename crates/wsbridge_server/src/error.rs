//! Error types and handling for the bridge server.
//!
//! This module defines the error types that can occur during server operations,
//! providing clear categorization of different failure modes. Failures that the
//! server recovers from locally (unknown connections, per-connection I/O errors)
//! never surface as values of these types; they are logged and absorbed.

use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Enumeration of possible server errors.
///
/// Categorizes errors into network-related and internal server errors
/// to help with debugging and error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures or accept loop issues
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server errors, e.g. the bound socket cannot report its address
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reason a WebSocket handshake was refused by the server policy.
///
/// A rejected handshake never produces a lifecycle event; the connection
/// never reaches the open state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeRejection {
    /// The `Origin` header was missing or not in the configured allow-list
    #[error("origin denied: {}", .origin.as_deref().unwrap_or("<none>"))]
    OriginDenied { origin: Option<String> },

    /// None of the requested subprotocols is in the configured allow-list
    #[error("protocol denied: {}", list_or_none(.requested))]
    ProtocolDenied { requested: Vec<String> },
}

fn list_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}

impl HandshakeRejection {
    /// WebSocket close code describing the rejection.
    ///
    /// Origin denial maps to policy violation (1008), protocol denial
    /// to protocol error (1002).
    pub fn close_code(&self) -> CloseCode {
        match self {
            HandshakeRejection::OriginDenied { .. } => CloseCode::Policy,
            HandshakeRejection::ProtocolDenied { .. } => CloseCode::Protocol,
        }
    }

    /// HTTP status used when the rejection is written as the upgrade response.
    pub fn http_status(&self) -> StatusCode {
        match self {
            HandshakeRejection::OriginDenied { .. } => StatusCode::FORBIDDEN,
            HandshakeRejection::ProtocolDenied { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failure to hand an event to the event sink.
///
/// Sink failures are reported back through the sink's own error channel
/// and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The event could not be encoded
    #[error("event encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The consumer on the other side of the sink is gone
    #[error("event sink closed: {0}")]
    Closed(String),
}
