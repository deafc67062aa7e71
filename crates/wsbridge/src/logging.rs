//! Diagnostic logging for the bridge.
//!
//! stdout carries the event stream, so every log line goes to stderr. The
//! format is human-readable or JSON; ANSI colors are only used when stderr is
//! a terminal.

use crate::config::LoggingSettings;
use std::io::IsTerminal;
use tracing::info;
use tracing_subscriber::{
    filter::{Directive, ParseError},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Width of the banner box between its borders.
const BANNER_WIDTH: usize = 44;

/// Frame-level chatter from the WebSocket engine, kept below the bridge's own
/// level unless `RUST_LOG` says otherwise.
const ENGINE_DIRECTIVES: [&str; 2] = ["tungstenite=warn", "tokio_tungstenite=warn"];

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. `json_format` is the
/// `--json-logs` override and forces JSON even if the file says otherwise.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| level_filter(&config.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_thread_ids(true)
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false)
                .with_thread_ids(true)
            )
            .try_init()?;
    }

    info!("🔧 Logging to stderr at level: {}", config.level);
    Ok(())
}

/// Builds the filter for a configured level, quieting the engine's frame logs.
fn level_filter(level: &str) -> Result<EnvFilter, ParseError> {
    let mut filter = EnvFilter::try_new(level)?;
    for directive in ENGINE_DIRECTIVES {
        filter = filter.add_directive(directive.parse::<Directive>()?);
    }
    Ok(filter)
}

fn banner_lines(version: &str) -> Vec<String> {
    let border = "═".repeat(BANNER_WIDTH);
    let row = |text: String| format!("║{text:^BANNER_WIDTH$}║");

    vec![
        format!("╔{border}╗"),
        row(format!("WSBRIDGE v{version}")),
        row("WebSocket events as JSON lines on stdio".to_string()),
        format!("╚{border}╝"),
    ]
}

/// Logs the startup banner.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    for line in banner_lines(version) {
        info!("{}", line);
    }
}
