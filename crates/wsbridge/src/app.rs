//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that wires the server to the
//! stdio bridge, waits for shutdown, and drains open connections.

use crate::{
    bridge::{run_commands, JsonLineSink},
    config::AppConfig,
    logging::display_banner,
    signals::wait_for_shutdown_signal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use wsbridge_server::{ServerConfig, ServerCore, WebSocketServer};

/// Wait up to 3 seconds (30 * 100ms) for connections to close on shutdown
const MAX_WAIT_CYCLES: u32 = 30;

/// Main application struct.
///
/// # Architecture
///
/// * **Configuration Management**: Validated configuration from file and CLI
/// * **Server Orchestration**: Binds the WebSocket server with a JSON-lines sink
/// * **Command Input**: Applies commands read from stdin
/// * **Graceful Shutdown**: Signals stop the server and drain connections
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Server configuration derived from `config`
    server_config: ServerConfig,
}

impl Application {
    /// Creates a new application from a configuration with CLI overrides
    /// already applied.
    ///
    /// # Process
    ///
    /// 1. Validate merged configuration
    /// 2. Display startup banner
    /// 3. Convert to the server configuration
    pub fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        } else {
            info!("✅ Configuration loaded and validated successfully");
        }

        display_banner();

        let server_config = config.to_server_config()?;
        Ok(Self {
            config,
            server_config,
        })
    }

    /// Runs the server until a shutdown signal, a `stop` command, or a
    /// server failure.
    ///
    /// # Returns
    ///
    /// `Ok(())` after a graceful stop, or an error if the server failed; the
    /// failure has already been reported as `onFailure` on stdout.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting wsbridge");
        self.log_configuration_summary();

        let sink = Arc::new(JsonLineSink::stdout());
        let bound = WebSocketServer::new(self.server_config, sink).bind().await?;
        let core = bound.core();

        let commands_handle = tokio::spawn(run_commands(
            BufReader::new(tokio::io::stdin()),
            core.clone(),
        ));

        let signal_handle = {
            let core = core.clone();
            tokio::spawn(async move {
                match wait_for_shutdown_signal().await {
                    Ok(()) => core.stop().await,
                    Err(e) => error!("Failed to set up shutdown signal handler: {e}"),
                }
            })
        };

        info!("✅ wsbridge is now running!");
        info!("🔌 Ready to accept connections on {}", bound.local_addr());
        info!("🛑 Press Ctrl+C or send {{\"action\":\"stop\"}} to shut down");

        let result = bound.serve().await;

        signal_handle.abort();
        commands_handle.abort();

        if let Err(e) = result {
            error!("❌ Server error: {}", e);
            return Err(e.into());
        }

        info!("⏳ Waiting for connections to close...");
        drain_connections(&core).await;

        info!("✅ wsbridge shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!(
            "  🧭 Allowed origins: {}",
            match &self.config.server.allowed_origins {
                Some(entries) => entries.join(", "),
                None => "any".to_string(),
            }
        );
        info!(
            "  🧩 Subprotocols: {}",
            match &self.config.server.allowed_protocols {
                Some(entries) => entries.join(", "),
                None => "not negotiated".to_string(),
            }
        );
        info!("  ⚡ TCP_NODELAY: {}", self.config.server.tcp_no_delay);
    }
}

/// Waits for the close callbacks triggered by `stop()` to finish.
async fn drain_connections(core: &ServerCore) {
    let mut wait_cycles = 0;

    while wait_cycles < MAX_WAIT_CYCLES {
        if core.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        wait_cycles += 1;
    }

    if wait_cycles >= MAX_WAIT_CYCLES {
        warn!(
            "⏰ Timeout reached with {} connection(s) still open",
            core.connection_count().await
        );
    } else {
        info!("✅ All connections closed");
    }
}
