//! TCP listener and accept loop.

use crate::{
    config::ServerConfig,
    error::ServerError,
    events::EventSink,
    server::{handlers::handle_connection, ServerCore},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// An unstarted WebSocket server.
///
/// Configuration can only change here; binding consumes the server, so a
/// running listener never sees its policy change underneath it.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wsbridge_server::{ChannelSink, ServerConfig, WebSocketServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (sink, mut events) = ChannelSink::new();
/// let mut server = WebSocketServer::new(ServerConfig::default(), Arc::new(sink));
/// server.set_protocols(Some(vec!["json".to_string()]));
///
/// let bound = server.bind().await?;
/// let core = bound.core();
/// tokio::spawn(bound.serve());
///
/// while let Some((event, _)) = events.recv().await {
///     println!("{}", event.to_json()?);
/// }
/// # core.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct WebSocketServer {
    config: ServerConfig,
    sink: Arc<dyn EventSink>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self { config, sink }
    }

    /// Replaces the origin allow-list; `None` allows any origin.
    pub fn set_origins(&mut self, origins: Option<Vec<String>>) {
        self.config.allowed_origins = origins;
    }

    /// Replaces the subprotocol allow-list; `None` negotiates nothing.
    pub fn set_protocols(&mut self, protocols: Option<Vec<String>>) {
        self.config.allowed_protocols = protocols;
    }

    pub fn set_tcp_no_delay(&mut self, enabled: bool) {
        self.config.tcp_no_delay = enabled;
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket.
    ///
    /// A bind failure is a server-level failure: the sink receives
    /// `onFailure` before the error is returned.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let core = Arc::new(ServerCore::new(self.config, self.sink));
        let addr = core.config().bind_address;

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("Failed to bind to {addr}: {e}");
                core.on_error(None, Some(reason.clone())).await;
                return Err(ServerError::Network(reason));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                let reason = format!("Failed to read bound address: {e}");
                core.on_error(None, Some(reason.clone())).await;
                return Err(ServerError::Internal(reason));
            }
        };

        core.set_local_addr(local_addr);
        info!("🌐 WebSocket server listening on {}", local_addr);
        Ok(BoundServer { core, listener })
    }

    /// Binds and runs the accept loop until stopped or failed.
    pub async fn start(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }
}

/// A server whose socket is bound but whose accept loop is not yet running.
pub struct BoundServer {
    core: Arc<ServerCore>,
    listener: TcpListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Shared handle for issuing commands while the server runs.
    pub fn core(&self) -> Arc<ServerCore> {
        self.core.clone()
    }

    /// Runs the accept loop.
    ///
    /// Returns `Ok(())` once `stop()` is requested, or the accept error that
    /// failed the server.
    pub async fn serve(self) -> Result<(), ServerError> {
        let BoundServer { core, listener } = self;
        let mut shutdown_receiver = core.subscribe_shutdown();

        loop {
            if *shutdown_receiver.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown_receiver.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("📥 Accepted TCP connection from {}", addr);
                        let core = core.clone();
                        tokio::spawn(handle_connection(stream, addr, core));
                    }
                    Err(e) => {
                        let reason = format!("Failed to accept connection: {e}");
                        core.on_error(None, Some(reason.clone())).await;
                        return Err(ServerError::Network(reason));
                    }
                },
            }
        }

        info!("🛑 Accept loop on {} stopped", core.local_addr());
        Ok(())
    }
}
