//! HTTP transports built on `reqwest`
//!
//! Every outbound JSON call goes through [`BoundedClient::execute`], which
//! wraps the whole exchange (response head and body) in a deadline. When the
//! deadline fires the in-flight future is dropped, which cancels the request,
//! and the caller gets [`ClientError::Timeout`] rather than a transport error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use reqwest::{Client, RequestBuilder, redirect};
use tracing::error;
use url::Url;

use crate::error::ClientError;
use crate::telemetry::{FetchRecord, Recorder, ResponseRecord};
use crate::{Error, Result};

/// Idle pooled connections are dropped after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// TCP keep-alive probe interval
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// A fully read response from a bounded call
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body as text
    pub body: String,
}

/// HTTP client whose calls are bounded by a fixed deadline
#[derive(Clone)]
pub struct BoundedClient {
    client: Client,
    timeout: Duration,
    recorder: Arc<dyn Recorder>,
}

impl BoundedClient {
    /// Create a client with the given per-call deadline
    pub fn new(timeout: Duration, recorder: Arc<dyn Recorder>) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .tcp_nodelay(true)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            timeout,
            recorder,
        })
    }

    /// Underlying `reqwest` client, for building requests
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` on behalf of `user` and read the full response.
    ///
    /// Any status is returned as-is; interpreting it is the caller's job.
    pub async fn execute(
        &self,
        user: &str,
        request: RequestBuilder,
    ) -> std::result::Result<FetchedResponse, ClientError> {
        let request = request
            .build()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let method = request.method().clone();
        let url = request.url().to_string();

        let fetch = FetchRecord::new(user, &method, &url);
        self.recorder.record_fetch(&fetch, None);
        let started = Instant::now();

        let exchange = async {
            let response = self.client.execute(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            self.recorder.record_fetch(
                &fetch,
                Some(&ResponseRecord::capture(status, &headers, started.elapsed())),
            );
            let body = response.text().await?;
            Ok::<_, reqwest::Error>(FetchedResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                error!(%method, %url, error = %e, "Error during fetch");
                Err(e.into())
            }
            Err(_elapsed) => {
                error!(
                    %method,
                    %url,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Request timed out"
                );
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }
}

/// Connection pool used to reach the backend, chosen once from its scheme
#[derive(Debug, Clone)]
pub enum BackendTransport {
    /// Plain HTTP keep-alive pool
    Plain(Client),
    /// HTTPS-only keep-alive pool
    Tls(Client),
}

impl BackendTransport {
    /// Build the transport matching `target`'s scheme.
    ///
    /// Redirects are never followed; the client sees them verbatim.
    pub fn for_target(target: &Url, connect_timeout: Duration) -> Result<Self> {
        let builder = Client::builder()
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .tcp_nodelay(true)
            .connect_timeout(connect_timeout)
            .redirect(redirect::Policy::none());

        match target.scheme() {
            "http" => Ok(Self::Plain(builder.build()?)),
            "https" => Ok(Self::Tls(builder.https_only(true).build()?)),
            other => Err(Error::Config(format!(
                "Unsupported backend scheme '{other}' (expected http or https)"
            ))),
        }
    }

    /// The pooled client
    #[must_use]
    pub fn client(&self) -> &Client {
        match self {
            Self::Plain(client) | Self::Tls(client) => client,
        }
    }

    /// Whether this is the encrypted transport
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}
