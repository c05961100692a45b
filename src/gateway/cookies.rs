//! Session cookie inspection and expiry

use axum::{
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use time::OffsetDateTime;

use crate::session::SESSION_COOKIE;

/// Cookie set by the upstream identity proxy
pub const UPSTREAM_COOKIE: &str = "_oauth2_proxy";

/// Endpoint that clears gateway-visible cookies
pub const EXPIRE_COOKIES_PATH: &str = "/expire-cookies-and-redirect";

/// Where the browser goes after its cookies are cleared
pub const SIGN_IN_PATH: &str = "/oauth2/sign_in";

/// Which session cookies a request carries (non-empty values only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPresence {
    /// `_oauth2_proxy` present
    pub has_upstream_cookie: bool,
    /// `sid` present
    pub has_session_cookie: bool,
}

impl SessionPresence {
    /// Read presence flags from every `Cookie` header of a request
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let jar = CookieJar::from_headers(headers);
        let present = |name: &str| jar.get(name).is_some_and(|c| !c.value().is_empty());
        Self {
            has_upstream_cookie: present(UPSTREAM_COOKIE),
            has_session_cookie: present(SESSION_COOKIE),
        }
    }
}

/// Empty, already-expired cookie scoped to the whole site
fn expired_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .http_only(true)
        .expires(OffsetDateTime::UNIX_EPOCH)
        .build()
}

/// Clear `sid` and `_oauth2_proxy`, then send the browser to sign in
pub async fn expire_cookies_handler() -> impl IntoResponse {
    let jar = CookieJar::new()
        .add(expired_cookie(SESSION_COOKIE))
        .add(expired_cookie(UPSTREAM_COOKIE));
    (StatusCode::FOUND, [(header::LOCATION, SIGN_IN_PATH)], jar)
}
