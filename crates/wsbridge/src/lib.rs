//! # wsbridge - WebSocket events over stdio
//!
//! Runs the WebSocket server and bridges it to another process: lifecycle
//! events are written to stdout as JSON lines, commands are read from stdin.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! wsbridge
//!
//! # Only accept browser clients from one site, speaking "json"
//! wsbridge --origin https://app.example --protocol json
//!
//! # Override specific settings
//! wsbridge --config bridge.toml --bind 0.0.0.0:9000 --log-level debug
//! ```
//!
//! ## Configuration
//!
//! The server loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The server stops gracefully on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)
//! - a `{"action":"stop"}` command

use tracing::error;

pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the wsbridge binary.
///
/// 1. Command-line argument parsing
/// 2. Configuration loading and CLI overrides
/// 3. Logging system initialization
/// 4. Application creation and execution
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or a server failure
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_cli_overrides(&args);

    // Setup logging before anything else
    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(config) {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use config::{LoggingSettings, ServerSettings};
