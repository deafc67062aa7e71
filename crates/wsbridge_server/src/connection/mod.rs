//! Connection management for client connections.
//!
//! This module handles the identity side of client connections: the handles
//! the engine hands out, the handshake fields captured at upgrade time, and
//! the registry mapping identifiers to handles.

pub mod handle;
pub mod handshake;
pub mod registry;

pub use handle::{ConnectionHandle, Outbound};
pub use handshake::{rejection_response, HandshakeRequest};
pub use registry::Registry;
