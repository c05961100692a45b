//! First-contact provisioning.
//!
//! When an asserted identity arrives without a backend session, the gateway
//! makes sure a matching directory user exists, sets it a fresh random
//! password, logs in with that password and hands the resulting cookies to the
//! browser. Steps run strictly in order and the first failure ends the flow;
//! earlier side effects (a created user, a rotated password) are not undone.
//!
//! # Single flight
//!
//! Off by default: concurrent first contacts for one user each run their own
//! flow, and the last password rotation wins. With `single_flight` enabled, at
//! most one flow per username is in flight.
//! The flow is spawned onto the runtime, so it finishes even if the request
//! that started it goes away, and every request that arrives meanwhile awaits
//! the same result instead of rotating the password again. The flow keeps the
//! trace id of the request that started it.

use std::sync::Arc;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::RngExt;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::directory::UserDirectory;
use crate::error::ClientError;
use crate::gateway::auth::Identity;
use crate::session::SessionBroker;
use crate::telemetry;

/// Number of random bytes behind each generated password
pub const PASSWORD_BYTES: usize = 16;

/// Hex-encode raw password bytes (always `2 * PASSWORD_BYTES` characters)
#[must_use]
pub fn password_from_bytes(bytes: [u8; PASSWORD_BYTES]) -> String {
    hex::encode(bytes)
}

/// Fresh password from the thread-local CSPRNG
#[must_use]
pub fn generate_password() -> String {
    let bytes: [u8; PASSWORD_BYTES] = rand::rng().random();
    password_from_bytes(bytes)
}

/// Why a provisioning flow stopped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Existence check, creation or password rotation failed
    #[error("Directory failure: {0}")]
    Directory(ClientError),

    /// The backend login call failed
    #[error("Login failure: {0}")]
    Login(ClientError),

    /// Login succeeded but returned no `sid` cookie
    #[error("No sid cookie returned")]
    SidCookieMissing,

    /// The shared flow died before producing a result
    #[error("Provisioning aborted: {0}")]
    Aborted(String),
}

impl ProvisionError {
    /// Status returned to the client
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SidCookieMissing => StatusCode::UNAUTHORIZED,
            Self::Directory(_) | Self::Login(_) | Self::Aborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Body returned to the client; detail stays in the logs
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::SidCookieMissing => "Failed to retrieve sid cookie",
            Self::Directory(_) | Self::Login(_) | Self::Aborted(_) => {
                "Internal authentication error"
            }
        }
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        (self.status_code(), self.client_message()).into_response()
    }
}

/// Cookies minted by a successful flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSession {
    /// `Set-Cookie` values to pass to the browser unchanged
    pub set_cookies: Vec<HeaderValue>,
}

impl ProvisionedSession {
    /// `302` back to `original_url` carrying every minted cookie
    #[must_use]
    pub fn into_redirect(self, original_url: &str) -> Response {
        let mut response = StatusCode::FOUND.into_response();
        let headers = response.headers_mut();
        let location =
            HeaderValue::from_str(original_url).unwrap_or_else(|_| HeaderValue::from_static("/"));
        headers.insert(header::LOCATION, location);
        for cookie in self.set_cookies {
            headers.append(header::SET_COOKIE, cookie);
        }
        response
    }
}

type ProvisionResult = Result<ProvisionedSession, ProvisionError>;
type SharedFlow = Shared<BoxFuture<'static, ProvisionResult>>;

/// Runs the create-or-rotate, login, mint-cookie sequence
pub struct Provisioner {
    directory: Arc<dyn UserDirectory>,
    broker: Arc<dyn SessionBroker>,
    single_flight: bool,
    in_flight: DashMap<String, SharedFlow>,
}

impl Provisioner {
    /// Create an orchestrator over the given directory and broker
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        broker: Arc<dyn SessionBroker>,
        single_flight: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            broker,
            single_flight,
            in_flight: DashMap::new(),
        })
    }

    /// Number of usernames with a flow currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Provision a session for `identity`
    pub async fn provision(self: &Arc<Self>, identity: &Identity) -> ProvisionResult {
        if !self.single_flight {
            return self.run(identity).await;
        }

        let flow = match self.in_flight.entry(identity.username.clone()) {
            Entry::Occupied(entry) => {
                debug!(user = %identity.username, "Joining in-flight provisioning");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let this = Arc::clone(self);
                let owned = identity.clone();
                let trace_id = telemetry::current();
                let task = tokio::spawn(async move {
                    let result = match trace_id {
                        Some(id) => telemetry::with_trace_id(id, this.run(&owned)).await,
                        None => this.run(&owned).await,
                    };
                    this.in_flight.remove(&owned.username);
                    result
                });
                let flow = async move {
                    task.await
                        .unwrap_or_else(|e| Err(ProvisionError::Aborted(e.to_string())))
                }
                .boxed()
                .shared();
                entry.insert(flow.clone());
                flow
            }
        };

        flow.await
    }

    async fn run(&self, identity: &Identity) -> ProvisionResult {
        let username = identity.username.as_str();
        info!(user = %username, email = %identity.email, "Authenticating user");

        let exists = self
            .directory
            .exists(username)
            .await
            .map_err(ProvisionError::Directory)?;
        let password = generate_password();

        if exists {
            self.directory
                .rotate_password(username, &password)
                .await
                .map_err(ProvisionError::Directory)?;
        } else {
            self.directory
                .create(username, &identity.email, &password)
                .await
                .map_err(ProvisionError::Directory)?;
        }

        let login = self
            .broker
            .login(username, &password)
            .await
            .map_err(ProvisionError::Login)?;

        if !login.has_session_cookie() {
            error!(user = %username, "No sid cookie returned");
            return Err(ProvisionError::SidCookieMissing);
        }

        Ok(ProvisionedSession {
            set_cookies: login.set_cookies,
        })
    }
}
