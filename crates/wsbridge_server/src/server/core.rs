//! Core bridge between connection callbacks and the event sink.
//!
//! `ServerCore` receives lifecycle callbacks from the engine (handshake, open,
//! message, close, error) and commands from the sink side (send, close, stop).
//! The registry and the running/failed state live together behind one lock;
//! events are always emitted after that lock is released. A separate
//! emission gate orders callback events before the final `onFailure`.

use crate::{
    config::ServerConfig,
    connection::{ConnectionHandle, HandshakeRequest, Registry},
    error::HandshakeRejection,
    events::{Command, ConnectionInfo, Delivery, EventSink, ServerEvent, DEFAULT_CLOSE_CODE},
    policy,
};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, trace, warn};

/// Longest close reason that fits a control frame next to the 2-byte code.
const MAX_CLOSE_REASON: usize = 123;

/// Server-level state. `Failed` is terminal.
enum CoreState {
    Running {
        registry: Registry<ConnectionHandle>,
        sink: Arc<dyn EventSink>,
    },
    Failed,
}

/// Connection identity, handshake policy and event bridging.
///
/// # Thread Safety
///
/// Every callback and command may run concurrently from different tasks.
/// Registry reads and writes are serialized by a single `tokio::sync::Mutex`;
/// removal is idempotent, so a close command racing the close callback for
/// the same connection emits at most one `onClose`.
///
/// Callbacks emit while holding a read guard on the emission gate; the
/// failure transition closes the gate under its write guard, so every
/// in-flight callback event is delivered before `onFailure` and none after.
/// Commands never take the gate, so a sink may issue them while emitting.
pub struct ServerCore {
    /// Configuration, fixed for the lifetime of the core
    config: ServerConfig,

    /// Address actually bound, once known
    local_addr: OnceLock<SocketAddr>,

    state: Mutex<CoreState>,

    /// `false` once the server has failed
    emitting: RwLock<bool>,

    /// Flipped to `true` to stop the accept loop
    shutdown_sender: watch::Sender<bool>,
}

impl ServerCore {
    pub fn new(config: ServerConfig, sink: Arc<dyn EventSink>) -> Self {
        let (shutdown_sender, _) = watch::channel(false);
        Self {
            config,
            local_addr: OnceLock::new(),
            state: Mutex::new(CoreState::Running {
                registry: Registry::new(),
                sink,
            }),
            emitting: RwLock::new(true),
            shutdown_sender,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bound address, or the configured one before binding.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
            .get()
            .copied()
            .unwrap_or(self.config.bind_address)
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_sender.subscribe()
    }

    /// Whether the accept loop has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        *self.shutdown_sender.borrow()
    }

    pub async fn is_failed(&self) -> bool {
        matches!(*self.state.lock().await, CoreState::Failed)
    }

    /// Number of currently registered connections.
    pub async fn connection_count(&self) -> usize {
        match &*self.state.lock().await {
            CoreState::Running { registry, .. } => registry.len(),
            CoreState::Failed => 0,
        }
    }

    // ------------------------------------------------------------------
    // Engine callbacks
    // ------------------------------------------------------------------

    /// Evaluates a client handshake against the origin and protocol policy.
    ///
    /// Returns the negotiated subprotocol, which the engine must echo in the
    /// `Sec-WebSocket-Protocol` response header.
    pub fn on_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> Result<Option<String>, HandshakeRejection> {
        if let Err(rejection) = policy::authorize_origin(
            request.origin.as_deref(),
            self.config.allowed_origins.as_deref(),
        ) {
            warn!("⛔ Handshake {}", rejection);
            return Err(rejection);
        }

        policy::authorize_protocol(&request.protocols, self.config.allowed_protocols.as_deref())
            .map_err(|rejection| {
                warn!("⛔ Handshake {}", rejection);
                rejection
            })
    }

    /// Registers a freshly opened connection and emits `onOpen`.
    ///
    /// Returns the assigned identifier, or `None` if the server has failed,
    /// in which case the connection is closed again.
    pub async fn on_open(
        &self,
        handle: ConnectionHandle,
        request: &HandshakeRequest,
        accepted_protocol: Option<&str>,
    ) -> Option<String> {
        trace!("onopen");

        let emitting = self.emitting.read().await;
        if !*emitting {
            debug!("onopen: server failed, dropping {}", handle.remote_addr());
            handle.close(CloseCode::Away, "");
            return None;
        }

        let (uuid, sink) = {
            let mut state = self.state.lock().await;
            match &mut *state {
                CoreState::Running { registry, sink } => {
                    (registry.register(handle.clone()), sink.clone())
                }
                CoreState::Failed => {
                    debug!("onopen: server failed, dropping {}", handle.remote_addr());
                    handle.close(CloseCode::Away, "");
                    return None;
                }
            }
        };

        info!(
            "🔗 Connection {} (handle {}) from {}",
            uuid,
            handle.id(),
            handle.remote_addr()
        );

        let event = ServerEvent::Open {
            conn: ConnectionInfo {
                uuid: uuid.clone(),
                remote_addr: handle.remote_addr().ip().to_string(),
                accepted_protocol: accepted_protocol.unwrap_or_default().to_string(),
                http_fields: request.http_fields.clone(),
                resource: request.resource.clone(),
            },
        };
        deliver(&sink, event, Delivery::KeepListening).await;
        drop(emitting);

        Some(uuid)
    }

    /// Forwards a text message as `onMessage`; unknown handles are ignored.
    pub async fn on_message(&self, handle: &ConnectionHandle, text: String) {
        trace!("onmessage");

        let emitting = self.emitting.read().await;
        if !*emitting {
            debug!("onmessage: server failed");
            return;
        }

        match self.identify(handle).await {
            Some((uuid, sink)) => {
                let event = ServerEvent::Message { uuid, msg: text };
                deliver(&sink, event, Delivery::KeepListening).await;
            }
            None => debug!("onmessage: unknown websocket"),
        }
    }

    /// Emits `onClose` and unregisters the connection.
    ///
    /// The registry entry is removed whether or not the sink accepted the
    /// event.
    pub async fn on_close(
        &self,
        handle: &ConnectionHandle,
        code: u16,
        reason: String,
        remote: bool,
    ) {
        trace!("onclose");

        let emitting = self.emitting.read().await;
        if !*emitting {
            debug!("onclose: server failed");
            return;
        }

        let Some((uuid, sink)) = self.identify(handle).await else {
            debug!("onclose: unknown websocket");
            return;
        };

        info!(
            "❌ Connection {} from {} closed with {}",
            uuid,
            handle.remote_addr(),
            code
        );

        let event = ServerEvent::Close {
            uuid: uuid.clone(),
            code,
            reason,
            was_clean: remote,
        };
        deliver(&sink, event, Delivery::KeepListening).await;

        let mut state = self.state.lock().await;
        if let CoreState::Running { registry, .. } = &mut *state {
            // The identifier may already have been released by a close command.
            if registry.lookup_handle(&uuid) == Some(handle) {
                registry.remove(&uuid);
            }
        }
        drop(emitting);
    }

    /// Handles an error reported by the engine.
    ///
    /// With a handle the error is fatal to that connection only and it is
    /// closed with 1011; the engine's close callback does the rest. Without a
    /// handle the server itself has failed. A server error must not be
    /// reported from inside [`EventSink::emit`], which would wait on itself.
    pub async fn on_error(&self, handle: Option<&ConnectionHandle>, reason: Option<String>) {
        trace!("onerror");

        if let Some(reason) = &reason {
            error!("onerror: {}", reason);
        }

        match handle {
            Some(handle) => {
                if handle.is_open() {
                    handle.close(CloseCode::Error, "");
                }
            }
            None => self.fail(reason).await,
        }
    }

    /// Moves the server to `Failed` and emits the single `onFailure` event.
    async fn fail(&self, reason: Option<String>) {
        let previous = {
            // Waits for in-flight callback events to be delivered.
            let mut emitting = self.emitting.write().await;
            *emitting = false;
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, CoreState::Failed)
        };

        let CoreState::Running { registry, sink } = previous else {
            debug!("onerror: server already failed");
            return;
        };

        self.request_stop();
        for handle in registry.handles() {
            handle.close(CloseCode::Away, "");
        }
        drop(registry);

        let addr = self.local_addr();
        error!("💥 Server on {} failed", addr);

        let event = ServerEvent::Failure {
            addr: addr.ip().to_string(),
            port: addr.port(),
            reason,
        };
        deliver(&sink, event, Delivery::Final).await;
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Sends `message` to the connection named `uuid`.
    ///
    /// Unknown identifiers and a failed server make this a logged no-op.
    pub async fn send(&self, uuid: &str, message: String) {
        trace!("send");

        let handle = {
            let state = self.state.lock().await;
            match &*state {
                CoreState::Running { registry, .. } => registry.lookup_handle(uuid).cloned(),
                CoreState::Failed => None,
            }
        };

        match handle {
            Some(handle) => {
                if !handle.send(message) {
                    debug!("send: websocket {} is closing", uuid);
                }
            }
            None => debug!("send: unknown websocket {}", uuid),
        }
    }

    /// Closes the connection named `uuid` and unregisters it immediately.
    ///
    /// `code` of [`DEFAULT_CLOSE_CODE`] closes with 1000 and no reason, as does
    /// any code that may not appear in a close frame. Reasons longer than a
    /// control frame allows are cut at a character boundary.
    pub async fn close(&self, uuid: &str, code: i32, reason: &str) {
        trace!("close");

        let handle = {
            let mut state = self.state.lock().await;
            match &mut *state {
                CoreState::Running { registry, .. } => registry.remove(uuid),
                CoreState::Failed => None,
            }
        };

        let Some(handle) = handle else {
            debug!("close: unknown websocket {}", uuid);
            return;
        };

        let (code, reason) = resolve_close_code(code, reason);
        handle.close(code, reason);
    }

    /// Stops accepting connections and closes every open one with 1001.
    ///
    /// Close callbacks for those connections still emit `onClose`.
    pub async fn stop(&self) {
        info!("🛑 Stopping server on {}", self.local_addr());
        self.request_stop();

        let handles = {
            let state = self.state.lock().await;
            match &*state {
                CoreState::Running { registry, .. } => registry.handles(),
                CoreState::Failed => Vec::new(),
            }
        };

        for handle in handles {
            handle.close(CloseCode::Away, "");
        }
    }

    /// Applies a command received from the sink side.
    pub async fn dispatch(&self, command: Command) {
        match command {
            Command::Send { uuid, msg } => self.send(&uuid, msg).await,
            Command::Close { uuid, code, reason } => self.close(&uuid, code, &reason).await,
            Command::Stop => self.stop().await,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn identify(&self, handle: &ConnectionHandle) -> Option<(String, Arc<dyn EventSink>)> {
        let state = self.state.lock().await;
        match &*state {
            CoreState::Running { registry, sink } => registry
                .lookup_identifier(handle)
                .map(|uuid| (uuid.to_string(), sink.clone())),
            CoreState::Failed => None,
        }
    }

    /// Best-effort signal to the accept loop.
    fn request_stop(&self) {
        if self.shutdown_sender.send_replace(true) {
            debug!("Accept loop already stopping");
        } else if self.shutdown_sender.receiver_count() == 0 {
            warn!("No accept loop running on {}", self.local_addr());
        }
    }
}

async fn deliver(sink: &Arc<dyn EventSink>, event: ServerEvent, delivery: Delivery) {
    debug!("{} result: {:?}", event.action(), event);
    if let Err(e) = sink.emit(event, delivery).await {
        sink.report_error(e).await;
    }
}

fn resolve_close_code(code: i32, reason: &str) -> (CloseCode, &str) {
    if code == DEFAULT_CLOSE_CODE {
        return (CloseCode::Normal, "");
    }
    match u16::try_from(code) {
        Ok(sendable @ (1000..=1003 | 1007..=1013 | 3000..=4999)) => {
            (CloseCode::from(sendable), truncate_reason(reason))
        }
        _ => {
            warn!("close: invalid close code {}, using 1000", code);
            (CloseCode::Normal, "")
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    warn!("close: reason cut from {} to {} bytes", reason.len(), end);
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::error::SinkError;
    use crate::events::ChannelSink;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    type Events = mpsc::UnboundedReceiver<(ServerEvent, Delivery)>;

    fn core_with(config: ServerConfig) -> (Arc<ServerCore>, Events) {
        let (sink, events) = ChannelSink::new();
        (Arc::new(ServerCore::new(config, Arc::new(sink))), events)
    }

    fn core() -> (Arc<ServerCore>, Events) {
        core_with(ServerConfig::default())
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:51000".parse().unwrap()
    }

    fn request(resource: &str) -> HandshakeRequest {
        let mut request = HandshakeRequest {
            resource: resource.to_string(),
            ..Default::default()
        };
        request
            .http_fields
            .insert("host".to_string(), "localhost:8080".to_string());
        request
    }

    async fn open(
        core: &ServerCore,
        events: &mut Events,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>, String) {
        let (handle, outbound) = ConnectionHandle::new(peer());
        let uuid = core
            .on_open(handle.clone(), &request("/chat"), None)
            .await
            .expect("server should be running");
        let (event, _) = events.try_recv().expect("onOpen should be emitted");
        assert!(matches!(event, ServerEvent::Open { .. }));
        (handle, outbound, uuid)
    }

    #[tokio::test]
    async fn test_open_emits_connection_info() {
        let (core, mut events) = core();
        let (handle, _outbound) = ConnectionHandle::new(peer());

        let uuid = core
            .on_open(handle, &request("/chat"), Some("json"))
            .await
            .unwrap();

        let (event, delivery) = events.try_recv().unwrap();
        assert_eq!(delivery, Delivery::KeepListening);
        match event {
            ServerEvent::Open { conn } => {
                assert_eq!(conn.uuid, uuid);
                assert_eq!(conn.remote_addr, "10.0.0.7");
                assert_eq!(conn.accepted_protocol, "json");
                assert_eq!(conn.resource, "/chat");
                assert_eq!(conn.http_fields.get("host").map(String::as_str), Some("localhost:8080"));
            }
            other => panic!("Expected onOpen, got {:?}", other),
        }
        assert_eq!(core.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_message_from_known_and_unknown_handles() {
        let (core, mut events) = core();
        let (handle, _outbound, uuid) = open(&core, &mut events).await;

        core.on_message(&handle, "hello".to_string()).await;
        assert_eq!(
            events.try_recv().unwrap().0,
            ServerEvent::Message {
                uuid,
                msg: "hello".to_string()
            }
        );

        let (stranger, _rx) = ConnectionHandle::new(peer());
        core.on_message(&stranger, "ignored".to_string()).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_callback_unregisters() {
        let (core, mut events) = core();
        let (handle, mut outbound, uuid) = open(&core, &mut events).await;

        core.on_close(&handle, 1000, "bye".to_string(), true).await;
        assert_eq!(
            events.try_recv().unwrap().0,
            ServerEvent::Close {
                uuid: uuid.clone(),
                code: 1000,
                reason: "bye".to_string(),
                was_clean: true
            }
        );
        assert_eq!(core.connection_count().await, 0);

        core.send(&uuid, "late".to_string()).await;
        assert!(outbound.try_recv().is_err());

        // A second close callback for the same handle is ignored.
        core.on_close(&handle, 1000, String::new(), true).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_forwards_to_handle() {
        let (core, mut events) = core();
        let (_handle, mut outbound, uuid) = open(&core, &mut events).await;

        core.send(&uuid, "payload".to_string()).await;
        assert_eq!(outbound.try_recv().unwrap(), Outbound::Text("payload".to_string()));

        core.send("no-such-connection", "lost".to_string()).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_command_default_code() {
        let (core, mut events) = core();
        let (handle, mut outbound, uuid) = open(&core, &mut events).await;

        core.close(&uuid, DEFAULT_CLOSE_CODE, "ignored reason").await;
        assert_eq!(
            outbound.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::Normal,
                reason: String::new()
            }
        );
        assert_eq!(core.connection_count().await, 0);

        // The entry is already gone, so the engine's close callback is silent.
        core.on_close(&handle, 1000, String::new(), false).await;
        assert!(events.try_recv().is_err());

        core.send(&uuid, "late".to_string()).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_command_custom_and_invalid_codes() {
        let (core, mut events) = core();
        let (_a, mut outbound_a, uuid_a) = open(&core, &mut events).await;
        let (_b, mut outbound_b, uuid_b) = open(&core, &mut events).await;

        core.close(&uuid_a, 4000, "done").await;
        assert_eq!(
            outbound_a.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::from(4000),
                reason: "done".to_string()
            }
        );

        core.close(&uuid_b, 70_000, "too big").await;
        assert_eq!(
            outbound_b.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::Normal,
                reason: String::new()
            }
        );

        // Closing twice is harmless.
        core.close(&uuid_a, 4000, "again").await;
        assert!(outbound_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_command_never_sends_reserved_codes() {
        let (core, mut events) = core();

        for code in [0, 999, 1004, 1005, 1006, 1015, 2000] {
            let (_handle, mut outbound, uuid) = open(&core, &mut events).await;
            core.close(&uuid, code, "reserved").await;
            assert_eq!(
                outbound.try_recv().unwrap(),
                Outbound::Close {
                    code: CloseCode::Normal,
                    reason: String::new()
                },
                "code {code}"
            );
        }
    }

    #[tokio::test]
    async fn test_close_command_cuts_long_reasons() {
        let (core, mut events) = core();
        let (_a, mut outbound_a, uuid_a) = open(&core, &mut events).await;
        let (_b, mut outbound_b, uuid_b) = open(&core, &mut events).await;

        core.close(&uuid_a, 4000, &"x".repeat(200)).await;
        assert_eq!(
            outbound_a.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::from(4000),
                reason: "x".repeat(MAX_CLOSE_REASON)
            }
        );

        // 62 two-byte characters: the cut falls inside the last one.
        core.close(&uuid_b, 1000, &"é".repeat(62)).await;
        assert_eq!(
            outbound_b.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::Normal,
                reason: "é".repeat(61)
            }
        );
    }

    #[tokio::test]
    async fn test_connection_error_closes_with_unexpected_condition() {
        let (core, mut events) = core();
        let (handle, mut outbound, _uuid) = open(&core, &mut events).await;

        core.on_error(Some(&handle), Some("reset by peer".to_string())).await;
        assert_eq!(
            outbound.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::Error,
                reason: String::new()
            }
        );
        assert!(events.try_recv().is_err());
        assert!(!core.is_failed().await);

        // Already closing: no second close frame.
        core.on_error(Some(&handle), None).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_fails_once() {
        let (core, mut events) = core();
        let mut shutdown = core.subscribe_shutdown();
        let (handle, mut outbound, uuid) = open(&core, &mut events).await;

        core.on_error(None, Some("address in use".to_string())).await;

        let (event, delivery) = events.try_recv().unwrap();
        assert_eq!(delivery, Delivery::Final);
        assert_eq!(
            event,
            ServerEvent::Failure {
                addr: "127.0.0.1".to_string(),
                port: 8080,
                reason: Some("address in use".to_string())
            }
        );
        assert!(core.is_failed().await);
        assert!(*shutdown.borrow_and_update());
        assert!(matches!(outbound.try_recv(), Ok(Outbound::Close { .. })));

        // Everything afterwards is a no-op.
        core.on_error(None, Some("again".to_string())).await;
        core.send(&uuid, "late".to_string()).await;
        core.close(&uuid, DEFAULT_CLOSE_CODE, "").await;
        core.on_message(&handle, "late".to_string()).await;
        core.on_close(&handle, 1001, String::new(), false).await;
        assert!(outbound.try_recv().is_err());
        assert!(events.try_recv().is_err());
        assert_eq!(core.connection_count().await, 0);

        let (late, mut late_outbound) = ConnectionHandle::new(peer());
        assert!(core.on_open(late, &request("/"), None).await.is_none());
        assert!(matches!(late_outbound.try_recv(), Ok(Outbound::Close { .. })));
        assert!(events.try_recv().is_err());
    }

    /// Records every action and parks the first emission of `hold` until
    /// released.
    struct GatedSink {
        hold: &'static str,
        seen: std::sync::Mutex<Vec<&'static str>>,
        entered: Notify,
        release: Notify,
    }

    impl GatedSink {
        fn new(hold: &'static str) -> Self {
            Self {
                hold,
                seen: std::sync::Mutex::new(Vec::new()),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        fn seen(&self) -> Vec<&'static str> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn emit(&self, event: ServerEvent, _delivery: Delivery) -> Result<(), SinkError> {
            if event.action() == self.hold {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.seen.lock().unwrap().push(event.action());
            Ok(())
        }
    }

    /// Fails the server while a `hold` event is being emitted.
    async fn fail_during(hold: &'static str) -> Vec<&'static str> {
        let sink = Arc::new(GatedSink::new(hold));
        let core = Arc::new(ServerCore::new(ServerConfig::default(), sink.clone()));
        let (handle, _outbound) = ConnectionHandle::new(peer());
        if hold != "onOpen" {
            core.on_open(handle.clone(), &request("/"), None).await.unwrap();
        }

        let in_flight = {
            let core = core.clone();
            tokio::spawn(async move {
                match hold {
                    "onOpen" => {
                        let _ = core.on_open(handle, &request("/"), None).await;
                    }
                    "onMessage" => core.on_message(&handle, "hello".to_string()).await,
                    _ => core.on_close(&handle, 1000, String::new(), true).await,
                }
            })
        };
        sink.entered.notified().await;

        let failing = {
            let core = core.clone();
            tokio::spawn(async move { core.on_error(None, Some("boom".to_string())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!failing.is_finished());

        sink.release.notify_one();
        in_flight.await.unwrap();
        failing.await.unwrap();
        assert!(core.is_failed().await);

        sink.seen()
    }

    #[tokio::test]
    async fn test_failure_is_last_after_in_flight_callbacks() {
        assert_eq!(fail_during("onOpen").await, vec!["onOpen", "onFailure"]);
        assert_eq!(
            fail_during("onMessage").await,
            vec!["onOpen", "onMessage", "onFailure"]
        );
        assert_eq!(
            fail_during("onClose").await,
            vec!["onOpen", "onClose", "onFailure"]
        );
    }

    #[tokio::test]
    async fn test_commands_from_inside_emit_do_not_wait_on_failure() {
        let sink = Arc::new(GatedSink::new("onMessage"));
        let core = Arc::new(ServerCore::new(ServerConfig::default(), sink.clone()));
        let (handle, mut outbound) = ConnectionHandle::new(peer());
        let uuid = core.on_open(handle.clone(), &request("/"), None).await.unwrap();

        let in_flight = {
            let core = core.clone();
            let handle = handle.clone();
            tokio::spawn(async move { core.on_message(&handle, "hello".to_string()).await })
        };
        sink.entered.notified().await;

        // The message is still being emitted; commands go straight through.
        core.send(&uuid, "reply".to_string()).await;
        assert_eq!(outbound.try_recv().unwrap(), Outbound::Text("reply".to_string()));
        assert_eq!(core.connection_count().await, 1);

        sink.release.notify_one();
        in_flight.await.unwrap();
        assert_eq!(sink.seen(), vec!["onOpen", "onMessage"]);
    }

    #[tokio::test]
    async fn test_failure_reports_bound_address() {
        let (core, mut events) = core();
        core.set_local_addr("0.0.0.0:9123".parse().unwrap());
        core.on_error(None, None).await;

        assert_eq!(
            events.try_recv().unwrap().0,
            ServerEvent::Failure {
                addr: "0.0.0.0".to_string(),
                port: 9123,
                reason: None
            }
        );
    }

    #[test]
    fn test_handshake_policy() {
        let config = ServerConfig {
            allowed_origins: Some(vec!["https://a.test".to_string()]),
            allowed_protocols: Some(vec!["chat".to_string(), "json".to_string()]),
            ..Default::default()
        };
        let (sink, _events) = ChannelSink::new();
        let core = ServerCore::new(config, Arc::new(sink));

        let mut request = HandshakeRequest {
            origin: Some("https://b.test".to_string()),
            protocols: vec!["json".to_string(), "chat".to_string()],
            ..Default::default()
        };
        let denied = core.on_handshake(&request).unwrap_err();
        assert_eq!(u16::from(denied.close_code()), 1008);

        request.origin = Some("https://a.test".to_string());
        assert_eq!(core.on_handshake(&request), Ok(Some("json".to_string())));

        request.protocols = vec!["xml".to_string()];
        let denied = core.on_handshake(&request).unwrap_err();
        assert_eq!(u16::from(denied.close_code()), 1002);
    }

    #[test]
    fn test_handshake_without_policy() {
        let (core, _events) = core();
        let request = HandshakeRequest {
            protocols: vec!["anything".to_string()],
            ..Default::default()
        };
        assert_eq!(core.on_handshake(&request), Ok(None));
    }

    struct FailingSink {
        reported: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for FailingSink {
        async fn emit(&self, _event: ServerEvent, _delivery: Delivery) -> Result<(), SinkError> {
            Err(SinkError::Closed("consumer gone".to_string()))
        }

        async fn report_error(&self, _error: SinkError) {
            self.reported.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_cleanup() {
        let sink = Arc::new(FailingSink {
            reported: AtomicUsize::new(0),
        });
        let core = ServerCore::new(ServerConfig::default(), sink.clone());
        let (handle, _outbound) = ConnectionHandle::new(peer());

        let uuid = core.on_open(handle.clone(), &request("/"), None).await.unwrap();
        assert_eq!(core.connection_count().await, 1);

        core.on_close(&handle, 1000, String::new(), true).await;
        assert_eq!(core.connection_count().await, 0);
        assert_eq!(sink.reported.load(Ordering::SeqCst), 2);

        core.send(&uuid, "late".to_string()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_get_unique_identifiers() {
        let (core, mut events) = core();
        let mut tasks = Vec::new();

        for _ in 0..64 {
            let core = core.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, outbound) = ConnectionHandle::new(peer());
                let uuid = core.on_open(handle, &request("/"), None).await.unwrap();
                (uuid, outbound)
            }));
        }

        let mut identifiers = HashSet::new();
        let mut keep_alive = Vec::new();
        for task in tasks {
            let (uuid, outbound) = task.await.unwrap();
            assert!(identifiers.insert(uuid));
            keep_alive.push(outbound);
        }

        assert_eq!(core.connection_count().await, 64);
        let mut opened = 0;
        while events.try_recv().is_ok() {
            opened += 1;
        }
        assert_eq!(opened, 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_command_races_close_callback() {
        let (core, mut events) = core();

        for _ in 0..32 {
            let (handle, _outbound, uuid) = open(&core, &mut events).await;

            let by_command = {
                let core = core.clone();
                let uuid = uuid.clone();
                tokio::spawn(async move { core.close(&uuid, DEFAULT_CLOSE_CODE, "").await })
            };
            let by_callback = {
                let core = core.clone();
                tokio::spawn(async move { core.on_close(&handle, 1000, String::new(), true).await })
            };
            by_command.await.unwrap();
            by_callback.await.unwrap();

            let mut closes = 0;
            while let Ok((event, _)) = events.try_recv() {
                assert!(matches!(event, ServerEvent::Close { .. }));
                closes += 1;
            }
            assert!(closes <= 1);
            assert_eq!(core.connection_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_stop_closes_everything_with_going_away() {
        let (core, mut events) = core();
        let mut shutdown = core.subscribe_shutdown();
        let (_a, mut outbound_a, _) = open(&core, &mut events).await;
        let (_b, mut outbound_b, _) = open(&core, &mut events).await;

        core.dispatch(Command::Stop).await;

        assert!(core.is_stopping());
        assert!(*shutdown.borrow_and_update());
        for outbound in [&mut outbound_a, &mut outbound_b] {
            assert_eq!(
                outbound.try_recv().unwrap(),
                Outbound::Close {
                    code: CloseCode::Away,
                    reason: String::new()
                }
            );
        }
        assert!(!core.is_failed().await);
    }

    #[tokio::test]
    async fn test_dispatch_send_and_close() {
        let (core, mut events) = core();
        let (_handle, mut outbound, uuid) = open(&core, &mut events).await;

        core.dispatch(Command::Send {
            uuid: uuid.clone(),
            msg: "hi".to_string(),
        })
        .await;
        core.dispatch(Command::Close {
            uuid,
            code: 4001,
            reason: "later".to_string(),
        })
        .await;

        assert_eq!(outbound.try_recv().unwrap(), Outbound::Text("hi".to_string()));
        assert_eq!(
            outbound.try_recv().unwrap(),
            Outbound::Close {
                code: CloseCode::from(4001),
                reason: "later".to_string()
            }
        );
    }
}
