//! Backend session broker: trades a username/password for a Kibana session.

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use axum_extra::extract::cookie::Cookie;
use serde::Serialize;
use tracing::{error, info};
use url::Url;

use crate::error::ClientError;
use crate::transport::BoundedClient;

/// Kibana's internal login endpoint
pub const LOGIN_PATH: &str = "/internal/security/login";

/// Name of the backend session cookie
pub const SESSION_COOKIE: &str = "sid";

/// What a successful login handed back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResponse {
    /// Every `Set-Cookie` header of the login response, in order
    pub set_cookies: Vec<HeaderValue>,
}

impl LoginResponse {
    /// Whether any of the cookies is the session cookie (name compared
    /// case-insensitively)
    #[must_use]
    pub fn has_session_cookie(&self) -> bool {
        self.set_cookies
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| Cookie::parse(raw).ok())
            .any(|cookie| cookie.name().eq_ignore_ascii_case(SESSION_COOKIE))
    }
}

/// Exchanges credentials for a backend session
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Log in as `username`; any non-success status is a failure
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody<'a> {
    provider_type: &'a str,
    provider_name: &'a str,
    #[serde(rename = "currentURL")]
    current_url: &'a str,
    params: LoginParams<'a>,
}

#[derive(Serialize)]
struct LoginParams<'a> {
    username: &'a str,
    password: &'a str,
}

/// [`SessionBroker`] that posts to Kibana's basic-provider login
pub struct KibanaSessionBroker {
    http: BoundedClient,
    login_url: Url,
}

impl KibanaSessionBroker {
    /// Create a broker for the Kibana instance at `target`
    pub fn new(http: BoundedClient, target: &Url) -> Result<Self, ClientError> {
        let base = target.as_str().trim_end_matches('/');
        let login_url = Url::parse(&format!("{base}{LOGIN_PATH}"))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        Ok(Self { http, login_url })
    }

    /// The endpoint this broker posts to
    #[must_use]
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }
}

#[async_trait]
impl SessionBroker for KibanaSessionBroker {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        info!(user = %username, "Logging in to Kibana");
        let body = LoginBody {
            provider_type: "basic",
            provider_name: "basic",
            current_url: "/",
            params: LoginParams { username, password },
        };
        let request = self
            .http
            .client()
            .post(self.login_url.clone())
            .header("kbn-xsrf", "true")
            .header("x-elastic-internal-origin", "Kibana")
            .json(&body);

        let response = self.http.execute(username, request).await.inspect_err(|e| {
            error!(user = %username, error = %e, "Error logging in to Kibana");
        })?;

        if !response.status.is_success() {
            error!(user = %username, status = %response.status, body = %response.body, "Failed to login to Kibana");
            return Err(ClientError::Status {
                status: response.status.as_u16(),
                body: response.body,
            });
        }

        info!(user = %username, "Logged in to Kibana");
        Ok(LoginResponse {
            set_cookies: response
                .headers
                .get_all(header::SET_COOKIE)
                .iter()
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryRecorder;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{AppendHeaders, IntoResponse},
        routing::post,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Option<(HeaderMap, Value)>>>;

    async fn login(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let user = body["params"]["username"].as_str().unwrap_or_default().to_string();
        *seen.lock() = Some((headers, body));
        match user.as_str() {
            "denied" => (StatusCode::UNAUTHORIZED, "bad credentials").into_response(),
            _ => (
                StatusCode::OK,
                AppendHeaders([
                    (header::SET_COOKIE, "sid=Fe26.2**abc; Path=/; HttpOnly"),
                    (header::SET_COOKIE, "other=1; Path=/"),
                ]),
            )
                .into_response(),
        }
    }

    async fn broker() -> (KibanaSessionBroker, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(LOGIN_PATH, post(login))
            .with_state(Arc::clone(&seen));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let http = BoundedClient::new(Duration::from_secs(5), MemoryRecorder::shared()).unwrap();
        let target = Url::parse(&format!("http://{addr}")).unwrap();
        (KibanaSessionBroker::new(http, &target).unwrap(), seen)
    }

    #[test]
    fn session_cookie_detection_is_by_name() {
        let response = LoginResponse {
            set_cookies: vec![
                HeaderValue::from_static("other=sid=nope; Path=/"),
                HeaderValue::from_static(" SID=abc; Path=/"),
            ],
        };
        assert!(response.has_session_cookie());

        let response = LoginResponse {
            set_cookies: vec![
                HeaderValue::from_static("other-cookie=value; Path=/; HttpOnly"),
                HeaderValue::from_static("sid-without-value"),
            ],
        };
        assert!(!response.has_session_cookie());
        assert!(!LoginResponse::default().has_session_cookie());
    }

    #[test]
    fn login_url_joins_without_double_slash() {
        let http = BoundedClient::new(Duration::from_secs(1), MemoryRecorder::shared()).unwrap();
        let target = Url::parse("http://kibana:5601/").unwrap();
        let broker = KibanaSessionBroker::new(http, &target).unwrap();
        assert_eq!(
            broker.login_url().as_str(),
            "http://kibana:5601/internal/security/login"
        );
    }

    #[tokio::test]
    async fn login_posts_basic_provider_body_and_headers() {
        let (broker, seen) = broker().await;

        let response = broker.login("carol", "pw-123").await.unwrap();
        assert_eq!(response.set_cookies.len(), 2);
        assert!(response.has_session_cookie());

        let (headers, body) = seen.lock().take().unwrap();
        assert_eq!(headers.get("kbn-xsrf").unwrap(), "true");
        assert_eq!(headers.get("x-elastic-internal-origin").unwrap(), "Kibana");
        assert_eq!(
            body,
            json!({
                "providerType": "basic",
                "providerName": "basic",
                "currentURL": "/",
                "params": { "username": "carol", "password": "pw-123" }
            })
        );
    }

    #[tokio::test]
    async fn login_failure_carries_body() {
        let (broker, _) = broker().await;

        let err = broker.login("denied", "pw").await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Status {
                status: 401,
                body: "bad credentials".to_string()
            }
        );
    }
}
