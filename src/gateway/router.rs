//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{Identity, auth_middleware};
use super::cookies::{EXPIRE_COOKIES_PATH, expire_cookies_handler};
use super::proxy::Forwarder;
use crate::provision::Provisioner;
use crate::telemetry;

/// Shared application state
pub struct AppState {
    /// Email domains accepted from the identity header
    pub allowed_domains: Vec<String>,
    /// First-contact provisioning
    pub provisioner: Arc<Provisioner>,
    /// Reverse proxy to the backend
    pub forwarder: Arc<Forwarder>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler).fallback(forward_handler))
        .route(
            EXPIRE_COOKIES_PATH,
            get(expire_cookies_handler).fallback(forward_handler),
        )
        .fallback(forward_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ))
        .layer(middleware::from_fn(trace_id_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Scope each request to a fresh trace id
async fn trace_id_middleware(request: Request<Body>, next: Next) -> Response {
    telemetry::with_trace_id(telemetry::generate(), next.run(request)).await
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Everything that is not a gateway route goes to the backend
async fn forward_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let user = request
        .extensions()
        .get::<Identity>()
        .map(|identity| identity.username.clone());
    match state.forwarder.forward(user.as_deref(), request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
