//! User directory client (Elasticsearch security API)
//!
//! The gateway only ever needs three things from the directory: does a user
//! exist, create one, and overwrite a password. All three use HTTP basic
//! auth with the configured service account and share one deadline.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Serialize;
use tracing::{debug, error, info};
use url::Url;

use crate::error::ClientError;
use crate::transport::BoundedClient;

/// Role set given to every user the gateway creates
pub const DEFAULT_ROLES: &[&str] = &["viewer"];

/// Operations the provisioning flow needs from a user store
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether `username` exists
    async fn exists(&self, username: &str) -> Result<bool, ClientError>;

    /// Create `username` with the default roles and `full_name = username`
    async fn create(&self, username: &str, email: &str, password: &str)
    -> Result<(), ClientError>;

    /// Overwrite the password of an existing user
    async fn rotate_password(&self, username: &str, password: &str) -> Result<(), ClientError>;
}

#[derive(Serialize)]
struct CreateUserBody<'a> {
    password: &'a str,
    email: &'a str,
    roles: &'a [&'a str],
    full_name: &'a str,
}

#[derive(Serialize)]
struct PasswordBody<'a> {
    password: &'a str,
}

/// [`UserDirectory`] backed by `/_security/user` endpoints
pub struct ElasticDirectory {
    http: BoundedClient,
    target: Url,
    service_user: String,
    service_password: String,
}

impl ElasticDirectory {
    /// Create a client for the directory at `target`
    pub fn new(
        http: BoundedClient,
        target: Url,
        service_user: impl Into<String>,
        service_password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            target,
            service_user: service_user.into(),
            service_password: service_password.into(),
        }
    }

    /// `{target}/_security/user/{username}[/{suffix}]`, username encoded as one segment
    fn user_url(&self, username: &str, suffix: Option<&str>) -> Result<Url, ClientError> {
        let mut url = self.target.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ClientError::InvalidUrl(format!("{} cannot be a base URL", self.target))
            })?;
            segments.pop_if_empty().extend(["_security", "user", username]);
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.service_user, Some(&self.service_password))
    }
}

#[async_trait]
impl UserDirectory for ElasticDirectory {
    async fn exists(&self, username: &str) -> Result<bool, ClientError> {
        info!(user = %username, "Checking if user exists");
        let url = self.user_url(username, None)?;
        let request = self.authorized(self.http.client().get(url));

        let response = self.http.execute(username, request).await.inspect_err(|e| {
            error!(user = %username, error = %e, "Error checking user");
        })?;

        match response.status {
            StatusCode::OK => {
                debug!(user = %username, "User exists");
                Ok(true)
            }
            StatusCode::NOT_FOUND => {
                debug!(user = %username, "User not found");
                Ok(false)
            }
            status => {
                error!(user = %username, %status, body = %response.body, "Failed to check user");
                Err(ClientError::Status {
                    status: status.as_u16(),
                    body: response.body,
                })
            }
        }
    }

    async fn create(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        info!(user = %username, "Creating user");
        let url = self.user_url(username, None)?;
        let body = CreateUserBody {
            password,
            email,
            roles: DEFAULT_ROLES,
            full_name: username,
        };
        let request = self.authorized(self.http.client().post(url).json(&body));

        let response = self.http.execute(username, request).await.inspect_err(|e| {
            error!(user = %username, error = %e, "Error creating user");
        })?;

        if !response.status.is_success() {
            error!(user = %username, status = %response.status, body = %response.body, "Failed to create user");
            return Err(ClientError::Status {
                status: response.status.as_u16(),
                body: response.body,
            });
        }

        info!(user = %username, "User created");
        Ok(())
    }

    async fn rotate_password(&self, username: &str, password: &str) -> Result<(), ClientError> {
        info!(user = %username, "Updating password for user");
        let url = self.user_url(username, Some("_password"))?;
        let request = self.authorized(self.http.client().put(url).json(&PasswordBody { password }));

        let response = self.http.execute(username, request).await.inspect_err(|e| {
            error!(user = %username, error = %e, "Error updating password");
        })?;

        if !response.status.is_success() {
            error!(user = %username, status = %response.status, body = %response.body, "Failed to update password");
            return Err(ClientError::Status {
                status: response.status.as_u16(),
                body: response.body,
            });
        }

        info!(user = %username, "Password updated for user");
        Ok(())
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
        extract::{Path, State},
        http::HeaderMap,
        routing::{get, put},
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Seen {
        authorization: Option<String>,
        path_user: Option<String>,
        body: Option<Value>,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn get_user(
        State(seen): State<Shared>,
        Path(user): Path<String>,
        headers: HeaderMap,
    ) -> (StatusCode, &'static str) {
        let mut seen = seen.lock();
        seen.authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.path_user = Some(user.clone());
        match user.as_str() {
            "alice" => (StatusCode::OK, "{}"),
            "ghost" => (StatusCode::NOT_FOUND, "{}"),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "cluster red"),
        }
    }

    async fn post_user(
        State(seen): State<Shared>,
        Path(user): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, &'static str) {
        let mut seen = seen.lock();
        seen.path_user = Some(user.clone());
        seen.body = Some(body);
        if user == "rejected" {
            (StatusCode::BAD_REQUEST, "bad user")
        } else {
            (StatusCode::OK, r#"{"created":true}"#)
        }
    }

    async fn put_password(
        State(seen): State<Shared>,
        Path(user): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, &'static str) {
        let mut seen = seen.lock();
        seen.path_user = Some(user);
        seen.body = Some(body);
        (StatusCode::OK, "{}")
    }

    async fn directory() -> (ElasticDirectory, Shared) {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route("/_security/user/{user}", get(get_user).post(post_user))
            .route("/_security/user/{user}/_password", put(put_password))
            .with_state(Arc::clone(&seen));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let http = BoundedClient::new(Duration::from_secs(5), MemoryRecorder::shared()).unwrap();
        let target = Url::parse(&format!("http://{addr}/")).unwrap();
        (ElasticDirectory::new(http, target, "elastic", "changeme"), seen)
    }

    #[test]
    fn user_url_encodes_username_and_keeps_base_path() {
        let http = BoundedClient::new(Duration::from_secs(1), MemoryRecorder::shared()).unwrap();
        let target = Url::parse("http://es:9200/proxy/").unwrap();
        let dir = ElasticDirectory::new(http, target, "u", "p");

        let url = dir.user_url("jo doe", Some("_password")).unwrap();
        assert_eq!(url.as_str(), "http://es:9200/proxy/_security/user/jo%20doe/_password");
    }

    #[tokio::test]
    async fn exists_maps_200_and_404_and_sends_basic_auth() {
        let (dir, seen) = directory().await;

        assert!(dir.exists("alice").await.unwrap());
        assert_eq!(
            seen.lock().authorization.as_deref(),
            Some("Basic ZWxhc3RpYzpjaGFuZ2VtZQ==")
        );
        assert!(!dir.exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn exists_fails_with_body_on_other_status() {
        let (dir, _) = directory().await;

        let err = dir.exists("broken").await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Status {
                status: 503,
                body: "cluster red".to_string()
            }
        );
    }

    #[tokio::test]
    async fn create_sends_viewer_role_and_full_name() {
        let (dir, seen) = directory().await;

        dir.create("bob", "bob@example.com", "0123456789abcdef0123456789abcdef")
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.path_user.as_deref(), Some("bob"));
        assert_eq!(
            seen.body,
            Some(json!({
                "password": "0123456789abcdef0123456789abcdef",
                "email": "bob@example.com",
                "roles": ["viewer"],
                "full_name": "bob"
            }))
        );
    }

    #[tokio::test]
    async fn create_failure_carries_body() {
        let (dir, _) = directory().await;

        let err = dir.create("rejected", "r@example.com", "pw").await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Status {
                status: 400,
                body: "bad user".to_string()
            }
        );
    }

    #[tokio::test]
    async fn rotate_password_sends_password_only() {
        let (dir, seen) = directory().await;

        dir.rotate_password("alice", "fresh").await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.path_user.as_deref(), Some("alice"));
        assert_eq!(seen.body, Some(json!({ "password": "fresh" })));
    }
}
