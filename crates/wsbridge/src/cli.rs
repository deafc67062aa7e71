//! Command-line interface handling for the wsbridge server.
//!
//! This module provides command-line argument parsing using the `clap` crate.
//! Every option overrides the matching configuration file setting.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Origin allow-list override; empty means "use the config file"
    pub origins: Vec<String>,
    /// Subprotocol allow-list override; empty means "use the config file"
    pub protocols: Vec<String>,
    /// Whether to force TCP_NODELAY on accepted sockets
    pub tcp_no_delay: bool,
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let list = |id: &str| -> Vec<String> {
            matches
                .get_many::<String>(id)
                .map(|values| values.cloned().collect())
                .unwrap_or_default()
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            origins: list("origin"),
            protocols: list("protocol"),
            tcp_no_delay: matches.get_flag("tcp-no-delay"),
        }
    }
}

fn command() -> Command {
    Command::new("wsbridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("WebSocket server bridging connection events to JSON lines on stdio")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 127.0.0.1:8080)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("origin")
                .long("origin")
                .value_name("ORIGIN")
                .help("Allowed Origin header value (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("protocol")
                .long("protocol")
                .value_name("PROTOCOL")
                .help("Allowed subprotocol, in no particular order (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("tcp-no-delay")
                .long("tcp-no-delay")
                .help("Disable Nagle's algorithm on accepted connections")
                .action(ArgAction::SetTrue),
        )
}
