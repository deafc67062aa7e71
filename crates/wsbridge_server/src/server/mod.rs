//! Core server implementation and connection handling.
//!
//! This module contains the connection/identity core, the per-connection
//! engine glue, and the listener that ties them to a TCP socket.

pub mod core;
pub mod handlers;
pub mod listener;

pub use core::ServerCore;
pub use listener::{BoundServer, WebSocketServer};
