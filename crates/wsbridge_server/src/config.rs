//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize the bridge server. Configuration is fixed once the
//! server is bound; the setters on [`crate::WebSocketServer`] are only
//! reachable before that point.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Configuration structure for the bridge server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Allowed `Origin` values. `None` accepts every origin.
    pub allowed_origins: Option<Vec<String>>,

    /// Allowed subprotocols. `None` disables subprotocol negotiation.
    pub allowed_protocols: Option<Vec<String>>,

    /// Whether to set `TCP_NODELAY` on accepted sockets
    pub tcp_no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            allowed_origins: None,
            allowed_protocols: None,
            tcp_no_delay: false,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on all interfaces at `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Default::default()
        }
    }
}
