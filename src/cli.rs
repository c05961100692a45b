//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Kibana auth gateway - provisions Elasticsearch users for proxied identities
#[derive(Parser, Debug)]
#[command(name = "kibana-auth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KIBANA_AUTH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate configuration, print a summary, then exit
    CheckConfig,
}
