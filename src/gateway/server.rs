//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use super::proxy::Forwarder;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::directory::ElasticDirectory;
use crate::provision::Provisioner;
use crate::session::KibanaSessionBroker;
use crate::telemetry::{Recorder, TracingRecorder};
use crate::transport::BoundedClient;
use crate::{Error, Result};

/// Kibana auth gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway that logs through `tracing`
    pub fn new(config: Config) -> Result<Self> {
        Self::with_recorder(config, Arc::new(TracingRecorder))
    }

    /// Create a gateway with an explicit request/fetch recorder
    pub fn with_recorder(config: Config, recorder: Arc<dyn Recorder>) -> Result<Self> {
        config.validate()?;
        let kibana_target = config.kibana.target_url()?;
        let elastic_target = config.elastic.target_url()?;

        let http = BoundedClient::new(config.elastic.timeout(), Arc::clone(&recorder))?;
        let directory = ElasticDirectory::new(
            http.clone(),
            elastic_target,
            config.elastic.username.clone(),
            config.elastic.password.clone(),
        );
        let broker = KibanaSessionBroker::new(http, &kibana_target)
            .map_err(|e| Error::Config(format!("Invalid Kibana target: {e}")))?;
        let provisioner = Provisioner::new(
            Arc::new(directory),
            Arc::new(broker),
            config.auth.single_flight,
        );
        let forwarder = Forwarder::new(kibana_target, config.kibana.timeout(), recorder)?;

        let state = Arc::new(AppState {
            allowed_domains: config.auth.allowed_email_domains.clone(),
            provisioner,
            forwarder: Arc::new(forwarder),
        });

        Ok(Self { config, state })
    }

    /// Router serving this gateway
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("KIBANA AUTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(target = %self.config.kibana.target, "Kibana");
        info!(target = %self.config.elastic.target, user = %self.config.elastic.username, "Elasticsearch");
        info!(
            domains = ?self.config.auth.allowed_email_domains,
            single_flight = self.config.auth.single_flight,
            "Allowed email domains"
        );
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
