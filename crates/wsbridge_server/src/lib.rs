//! # wsbridge server - WebSocket connection bridge
//!
//! A WebSocket server core that owns connection identity and handshake policy
//! and forwards every lifecycle event to a pluggable event sink. The server
//! contains **no application logic**: whatever consumes the events decides
//! what to send, whom to close, and when to stop.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Handshake Policy** - Origin allow-list and subprotocol negotiation
//! * **Connection Registry** - Bidirectional identifier ↔ handle mapping
//! * **Server Core** - Lifecycle callbacks, commands and the `Running → Failed`
//!   state machine
//! * **Event Sink** - Receives typed [`ServerEvent`]s, serialized as JSON only at
//!   the boundary
//!
//! ### Event Flow
//!
//! 1. A client upgrades; the policy decides and the accepted protocol is echoed
//! 2. The connection gets a fresh identifier and the sink receives `onOpen`
//! 3. Text frames become `onMessage` events
//! 4. The sink answers with [`Command`]s (`send`, `close`, `stop`)
//! 5. Teardown produces `onClose`; a server-level failure produces one final
//!    `onFailure`
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsbridge_server::{create_server, ChannelSink, Command, ServerEvent};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, mut events) = ChannelSink::new();
//! let bound = create_server(Arc::new(sink)).bind().await?;
//! let core = bound.core();
//! tokio::spawn(bound.serve());
//!
//! // Echo every message back to its sender
//! while let Some((event, _)) = events.recv().await {
//!     if let ServerEvent::Message { uuid, msg } = event {
//!         core.dispatch(Command::Send { uuid, msg }).await;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! * [`ServerError`] - setup failures returned from `bind`/`serve`
//! * [`HandshakeRejection`] - refused upgrades, never surfaced as events
//! * [`SinkError`] - events the sink could not take, routed to
//!   [`EventSink::report_error`]
//!
//! ## Thread Safety
//!
//! Callbacks for different connections and commands from the sink run
//! concurrently. The registry and server state share a single lock, and no
//! event is emitted while that lock is held.

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use connection::{ConnectionHandle, HandshakeRequest, Registry};
pub use error::{HandshakeRejection, ServerError, SinkError};
pub use events::{
    ChannelSink, Command, ConnectionInfo, Delivery, EventSink, ServerEvent, DEFAULT_CLOSE_CODE,
};
pub use server::{BoundServer, ServerCore, WebSocketServer};
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod policy;
pub mod server;
pub mod utils;
