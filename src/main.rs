//! Kibana Auth Gateway
//!
//! Bridges an upstream identity proxy to Kibana's native sessions.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info};

use kibana_auth_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // .env never overrides variables that are already set
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => error!("Failed to read .env file: {e}"),
    }

    match cli.command {
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration, apply CLI overrides and validate
fn load_config(cli: &Cli) -> Option<Config> {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return None;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    if let Err(e) = config.validate() {
        error!("{e}");
        return None;
    }

    info!("Environment variables loaded successfully");
    for (key, value) in config.summary() {
        info!("{key}: {value}");
    }
    Some(config)
}

/// Validate configuration without serving
fn check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Some(config) => {
            for (key, value) in config.summary() {
                println!("{key:<28} {value}");
            }
            println!("Configuration OK");
            ExitCode::SUCCESS
        }
        None => ExitCode::FAILURE,
    }
}

/// Run the gateway server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting Kibana auth gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
