//! Reverse proxy to the Kibana backend
//!
//! Authenticated requests are streamed to the backend over a keep-alive
//! transport chosen once from the target scheme. Responses, including the
//! backend's own 3xx/4xx/5xx, pass through untouched except for logout,
//! whose `Location` is pointed at the cookie-expiry endpoint. Failing to get a
//! response at all is the one case that becomes a `502`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::cookies::EXPIRE_COOKIES_PATH;
use crate::Result;
use crate::telemetry::{Recorder, RequestRecord, ResponseRecord};
use crate::transport::BackendTransport;

/// Logout route on both sides of the proxy
pub const LOGOUT_PATH: &str = "/api/security/logout";

/// Body of every `502`
pub const BAD_GATEWAY_MESSAGE: &str = "Failed to reach Kibana";

/// Connection-scoped headers never copied across the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The backend could not be reached
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Connection, DNS, TLS or protocol failure
    #[error("Backend transport failure: {0}")]
    Transport(String),

    /// No response head within the deadline
    #[error("Backend did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, BAD_GATEWAY_MESSAGE).into_response()
    }
}

/// Streams requests to the backend
pub struct Forwarder {
    target: Url,
    transport: BackendTransport,
    timeout: Duration,
    recorder: Arc<dyn Recorder>,
}

/// Whether `path` is the logout route or below it
#[must_use]
pub fn is_logout_path(path: &str) -> bool {
    path.strip_prefix(LOGOUT_PATH)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

impl Forwarder {
    /// Create a forwarder for `target`; the response-head wait is bounded by `timeout`
    pub fn new(target: Url, timeout: Duration, recorder: Arc<dyn Recorder>) -> Result<Self> {
        let transport = BackendTransport::for_target(&target, timeout)?;
        debug!(target = %target, tls = transport.is_tls(), "Backend transport ready");
        Ok(Self {
            target,
            transport,
            timeout,
            recorder,
        })
    }

    /// Backend URL for an inbound URI, and whether it is a logout
    pub fn target_for(&self, uri: &Uri) -> std::result::Result<(Url, bool), ProxyError> {
        let base = self.target.as_str().trim_end_matches('/');
        let path = uri.path();
        let logout = is_logout_path(path);

        let raw = if logout {
            format!("{base}{LOGOUT_PATH}")
        } else {
            match uri.query() {
                Some(query) => format!("{base}{path}?{query}"),
                None => format!("{base}{path}"),
            }
        };

        Url::parse(&raw)
            .map(|url| (url, logout))
            .map_err(|e| ProxyError::Transport(format!("invalid backend URL {raw}: {e}")))
    }

    /// Proxy `request` for `user`
    pub async fn forward(
        &self,
        user: Option<&str>,
        request: Request<Body>,
    ) -> std::result::Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let (url, logout) = self.target_for(&parts.uri)?;

        let record = RequestRecord::capture(user, &parts.method, &parts.uri.to_string(), &parts.headers);
        self.recorder.record_request_start(&record);
        let started = Instant::now();

        let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let mut outbound = self
            .transport
            .client()
            .request(parts.method.clone(), url.clone())
            .headers(headers);
        if has_body {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = match tokio::time::timeout(self.timeout, outbound.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(method = %parts.method, url = %url, error = %e, "Proxy error");
                return Err(ProxyError::Transport(e.to_string()));
            }
            Err(_elapsed) => {
                error!(method = %parts.method, url = %url, "Proxy timed out waiting for backend");
                return Err(ProxyError::Timeout(self.timeout));
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        if logout {
            headers.insert(header::LOCATION, HeaderValue::from_static(EXPIRE_COOKIES_PATH));
        }
        self.recorder.record_request_end(
            &record,
            &ResponseRecord::capture(status, &headers, started.elapsed()),
        );

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryRecorder;
    use pretty_assertions::assert_eq;

    fn forwarder(target: &str) -> Forwarder {
        Forwarder::new(
            Url::parse(target).unwrap(),
            Duration::from_secs(5),
            MemoryRecorder::shared(),
        )
        .unwrap()
    }

    #[test]
    fn logout_matching() {
        assert!(is_logout_path("/api/security/logout"));
        assert!(is_logout_path("/api/security/logout/extra"));
        assert!(!is_logout_path("/api/security/logouts"));
        assert!(!is_logout_path("/api/security/login"));
    }

    #[test]
    fn path_and_query_are_kept() {
        let fwd = forwarder("http://kibana:5601");
        let (url, logout) = fwd
            .target_for(&Uri::from_static("/app/discover?_g=(time:now)"))
            .unwrap();
        assert_eq!(url.as_str(), "http://kibana:5601/app/discover?_g=(time:now)");
        assert!(!logout);
    }

    #[test]
    fn base_path_is_prefixed() {
        let fwd = forwarder("https://example.org/kibana/");
        let (url, _) = fwd.target_for(&Uri::from_static("/app/home")).unwrap();
        assert_eq!(url.as_str(), "https://example.org/kibana/app/home");
        assert!(fwd.transport.is_tls());
    }

    #[test]
    fn logout_is_canonicalized() {
        let fwd = forwarder("http://kibana:5601");
        let (url, logout) = fwd
            .target_for(&Uri::from_static("/api/security/logout/now?next=/app"))
            .unwrap();
        assert_eq!(url.as_str(), "http://kibana:5601/api/security/logout");
        assert!(logout);
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        headers.insert(header::COOKIE, HeaderValue::from_static("sid=1"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::COOKIE));
    }

    #[test]
    fn errors_become_bad_gateway() {
        let response = ProxyError::Timeout(Duration::from_secs(1)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let response = ProxyError::Transport("refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
