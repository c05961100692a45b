//! Kibana Auth Gateway Library
//!
//! Authentication-bridging reverse proxy for Kibana. An upstream identity
//! proxy (oauth2-proxy) asserts the caller's email in `x-forwarded-email` and
//! sets its own session cookie; this gateway turns that assertion into a
//! native Kibana session.
//!
//! # Features
//!
//! - **Credential validation**: identity header shape, domain allowlist and
//!   upstream cookie, each rejection with its own message
//! - **Lazy provisioning**: create or re-password the matching Elasticsearch
//!   user, log in to Kibana and hand the `sid` cookie to the browser
//! - **Single flight** (opt-in): concurrent first contacts for one user share
//!   a flow
//! - **Reverse proxy**: streaming passthrough with logout rewriting and `502`
//!   on unreachable backends
//! - **Cookie expiry**: one endpoint that clears both session cookies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod provision;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
