//! Credential validation middleware
//!
//! Every non-public request must carry a trusted identity assertion
//! (`x-forwarded-email`) from an allowed domain plus the upstream proxy
//! session cookie. Requests that pass are either forwarded (a backend session
//! already exists) or sent through first-contact provisioning.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, warn};

use super::cookies::SessionPresence;
use super::router::AppState;

/// Header carrying the upstream-verified email address
pub const EMAIL_HEADER: &str = "x-forwarded-email";

/// Paths whose `GET`/`HEAD` requests skip the credential check (exact match)
pub const PUBLIC_PATHS: &[&str] = &["/health", super::cookies::EXPIRE_COOKIES_PATH];

/// Identity derived from a valid assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Full asserted email
    pub email: String,
    /// Text before the first `@`
    pub username: String,
    /// Text after the first `@` (up to any further `@`)
    pub domain: String,
}

impl Identity {
    /// Split `email` into username and domain; both must be non-empty
    #[must_use]
    pub fn parse(email: &str) -> Option<Self> {
        let mut parts = email.split('@');
        let username = parts.next().filter(|s| !s.is_empty())?;
        let domain = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            email: email.to_string(),
            username: username.to_string(),
            domain: domain.to_string(),
        })
    }
}

/// Why a request was turned away
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No identity header (or an empty one)
    #[error("Authentication header is missing")]
    HeaderMissing,
    /// Header is not `local@domain`
    #[error("Authentication header is invalid")]
    HeaderInvalid,
    /// Domain not in the allowlist
    #[error("Authentication header not allowed")]
    DomainNotAllowed,
    /// Upstream proxy cookie absent
    #[error("Authentication cookie is missing")]
    CookieMissing,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Decide whether a request may proceed.
///
/// Checks run in a fixed order, so a request with several problems always
/// gets the message of the first one.
pub fn validate(
    email: Option<&str>,
    has_upstream_cookie: bool,
    allowed_domains: &[String],
) -> Result<Identity, Rejection> {
    let email = email
        .filter(|e| !e.is_empty())
        .ok_or(Rejection::HeaderMissing)?;
    let identity = Identity::parse(email).ok_or(Rejection::HeaderInvalid)?;

    if !allowed_domains.iter().any(|d| *d == identity.domain) {
        return Err(Rejection::DomainNotAllowed);
    }
    if !has_upstream_cookie {
        return Err(Rejection::CookieMissing);
    }
    Ok(identity)
}

/// Raw value of the identity header, if any
fn email_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(EMAIL_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// Whether a request bypasses validation
///
/// Other methods on the public paths are validated and proxied.
#[must_use]
pub fn is_public_request(method: &Method, path: &str) -> bool {
    matches!(*method, Method::GET | Method::HEAD) && PUBLIC_PATHS.contains(&path)
}

/// Authentication middleware
///
/// Valid requests with a backend session continue to the forwarder with the
/// [`Identity`] attached as an extension. Valid requests without one are
/// answered here by provisioning.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_public_request(request.method(), path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let headers = request.headers();
    let presence = SessionPresence::from_headers(headers);
    let email = email_header(headers);

    let identity = match validate(
        email.as_deref(),
        presence.has_upstream_cookie,
        &state.allowed_domains,
    ) {
        Ok(identity) => identity,
        Err(rejection) => {
            warn!(
                path = %path,
                email = email.as_deref().unwrap_or_default(),
                reason = %rejection,
                "Rejected request"
            );
            return rejection.into_response();
        }
    };

    if presence.has_session_cookie {
        request.extensions_mut().insert(identity);
        return next.run(request).await;
    }

    let original_url = request
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);

    match state.provisioner.provision(&identity).await {
        Ok(session) => session.into_redirect(&original_url),
        Err(e) => {
            warn!(user = %identity.username, error = %e, "Provisioning failed");
            e.into_response()
        }
    }
}
