//! Factory functions for creating server instances.

use crate::{config::ServerConfig, events::EventSink, server::WebSocketServer};
use std::sync::Arc;

/// Creates a new server with default configuration.
///
/// The default binds `127.0.0.1:8080` with no origin or subprotocol policy.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use wsbridge_server::{create_server, ChannelSink};
///
/// let (sink, _events) = ChannelSink::new();
/// let server = create_server(Arc::new(sink));
/// assert_eq!(server.config().bind_address.port(), 8080);
/// ```
pub fn create_server(sink: Arc<dyn EventSink>) -> WebSocketServer {
    WebSocketServer::new(ServerConfig::default(), sink)
}

/// Creates a new server with custom configuration.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use wsbridge_server::{create_server_with_config, ChannelSink, ServerConfig};
///
/// let config = ServerConfig {
///     allowed_protocols: Some(vec!["json".to_string()]),
///     ..ServerConfig::with_port(9000)
/// };
///
/// let (sink, _events) = ChannelSink::new();
/// let server = create_server_with_config(config, Arc::new(sink));
/// assert!(server.config().allowed_origins.is_none());
/// ```
pub fn create_server_with_config(config: ServerConfig, sink: Arc<dyn EventSink>) -> WebSocketServer {
    WebSocketServer::new(config, sink)
}
