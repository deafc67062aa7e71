//! Live connection handles.
//!
//! A [`ConnectionHandle`] is the engine-side reference to one accepted
//! WebSocket. The connection task owns the socket; the handle only queues
//! outbound work for it, so sending through a handle whose connection is
//! gone is harmless and simply dropped.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Work queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A text frame
    Text(String),
    /// A close frame; the writer stops after sending it
    Close { code: CloseCode, reason: String },
}

#[derive(Debug)]
struct HandleState {
    open: AtomicBool,
    local_close: OnceLock<(u16, String)>,
}

/// Cloneable reference to a live connection.
///
/// Equality and hashing use the engine-assigned handle id, so clones of the
/// same handle are interchangeable as registry keys.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<HandleState>,
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end its writer task drains.
    pub fn new(remote_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            outbound,
            state: Arc::new(HandleState {
                open: AtomicBool::new(true),
                local_close: OnceLock::new(),
            }),
        };
        (handle, receiver)
    }

    /// Engine-assigned id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the connection may still be written to.
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// Queues a text frame. Returns `false` if the frame was dropped.
    pub fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Starts a server-initiated close.
    ///
    /// Only the first close on a handle takes effect; it is remembered so the
    /// close callback can report the code the server chose.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let _ = self
            .state
            .local_close
            .set((u16::from(code), reason.to_string()));
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Marks the connection as no longer writable without sending anything.
    pub fn mark_closed(&self) {
        self.state.open.store(false, Ordering::Release);
    }

    /// Code and reason of the server-initiated close, if there was one.
    pub fn local_close(&self) -> Option<(u16, String)> {
        self.state.local_close.get().cloned()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
