//! Request and fetch recording, plus per-request trace IDs.
//!
//! Components never reach for a global logger. Anything that talks to the
//! outside world receives an `Arc<dyn Recorder>` at construction time and
//! reports through it:
//!
//! - [`Recorder::record_request_start`] / [`Recorder::record_request_end`]
//!   bracket a proxied request.
//! - [`Recorder::record_fetch`] is called before an outbound call (without a
//!   response) and again once the response head arrives.
//!
//! [`TracingRecorder`] is the production implementation; [`MemoryRecorder`]
//! keeps events in memory for assertions.
//!
//! # Trace IDs
//!
//! A trace ID is a UUID v4 string prefixed with `"gw-"`. The router scopes
//! one to each inbound request via [`with_trace_id`]; [`current`] reads it
//! from anywhere inside that request's task.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, header};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

tokio::task_local! {
    /// Task-local storage for the current request trace ID.
    pub static TRACE_ID: String;
}

/// Generate a new gateway trace ID: `"gw-<uuid-v4>"`.
#[must_use]
pub fn generate() -> String {
    format!("gw-{}", Uuid::new_v4())
}

/// Return the trace ID set for the current task, or `None` outside a scope.
#[must_use]
pub fn current() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}

/// Run `future` with `trace_id` installed as the task-local trace ID.
pub async fn with_trace_id<F, T>(trace_id: String, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE_ID.scope(trace_id, future).await
}

/// Inbound request metadata captured when forwarding starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    /// Derived username, when the request was authenticated
    pub user: Option<String>,
    /// HTTP method
    pub method: String,
    /// Request path and query
    pub path: String,
    /// Client address (`x-forwarded-for` when present)
    pub ip: Option<String>,
    /// `user-agent` header
    pub user_agent: Option<String>,
    /// `referer` header
    pub referer: Option<String>,
    /// Trace ID of the enclosing request
    pub trace_id: Option<String>,
}

impl RequestRecord {
    /// Capture the loggable parts of an inbound request
    #[must_use]
    pub fn capture(user: Option<&str>, method: &Method, path: &str, headers: &HeaderMap) -> Self {
        Self {
            user: user.map(str::to_string),
            method: method.to_string(),
            path: path.to_string(),
            ip: header_string(headers, "x-forwarded-for"),
            user_agent: header_string(headers, header::USER_AGENT.as_str()),
            referer: header_string(headers, header::REFERER.as_str()),
            trace_id: current(),
        }
    }
}

/// Outbound call metadata (directory or backend login)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRecord {
    /// Username the call is made on behalf of
    pub user: String,
    /// HTTP method
    pub method: String,
    /// Full target URL
    pub url: String,
    /// Trace ID of the enclosing request
    pub trace_id: Option<String>,
}

impl FetchRecord {
    /// Describe an outbound call
    #[must_use]
    pub fn new(user: &str, method: &Method, url: &str) -> Self {
        Self {
            user: user.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            trace_id: current(),
        }
    }
}

/// Response metadata shared by proxied requests and fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_message: Option<String>,
    /// `content-length` header
    pub response_size: Option<String>,
    /// `content-type` header
    pub content_type: Option<String>,
    /// Milliseconds since the call started
    pub duration_ms: u128,
}

impl ResponseRecord {
    /// Capture a response head
    #[must_use]
    pub fn capture(status: StatusCode, headers: &HeaderMap, elapsed: Duration) -> Self {
        Self {
            status: status.as_u16(),
            status_message: status.canonical_reason().map(str::to_string),
            response_size: header_string(headers, header::CONTENT_LENGTH.as_str()),
            content_type: header_string(headers, header::CONTENT_TYPE.as_str()),
            duration_ms: elapsed.as_millis(),
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Logging capability injected into every component that does I/O
pub trait Recorder: Send + Sync {
    /// A request is about to be forwarded to the backend
    fn record_request_start(&self, request: &RequestRecord);

    /// The backend answered a forwarded request
    fn record_request_end(&self, request: &RequestRecord, response: &ResponseRecord);

    /// An outbound call is starting (`response` is `None`) or has answered
    fn record_fetch(&self, fetch: &FetchRecord, response: Option<&ResponseRecord>);
}

/// Emits every record as a structured `debug` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl Recorder for TracingRecorder {
    fn record_request_start(&self, request: &RequestRecord) {
        debug!(
            trace_id = request.trace_id.as_deref(),
            user = request.user.as_deref(),
            method = %request.method,
            path = %request.path,
            ip = request.ip.as_deref(),
            user_agent = request.user_agent.as_deref(),
            referer = request.referer.as_deref(),
            "Proxy request"
        );
    }

    fn record_request_end(&self, request: &RequestRecord, response: &ResponseRecord) {
        debug!(
            trace_id = request.trace_id.as_deref(),
            user = request.user.as_deref(),
            method = %request.method,
            path = %request.path,
            status = response.status,
            status_message = response.status_message.as_deref(),
            response_size = response.response_size.as_deref(),
            content_type = response.content_type.as_deref(),
            duration_ms = u64::try_from(response.duration_ms).unwrap_or(u64::MAX),
            "Proxy response"
        );
    }

    fn record_fetch(&self, fetch: &FetchRecord, response: Option<&ResponseRecord>) {
        match response {
            None => debug!(
                trace_id = fetch.trace_id.as_deref(),
                user = %fetch.user,
                method = %fetch.method,
                url = %fetch.url,
                "Fetch request"
            ),
            Some(response) => debug!(
                trace_id = fetch.trace_id.as_deref(),
                user = %fetch.user,
                method = %fetch.method,
                url = %fetch.url,
                status = response.status,
                status_message = response.status_message.as_deref(),
                response_size = response.response_size.as_deref(),
                content_type = response.content_type.as_deref(),
                duration_ms = u64::try_from(response.duration_ms).unwrap_or(u64::MAX),
                "Fetch response"
            ),
        }
    }
}

/// A single captured event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    /// `record_request_start`
    RequestStart(RequestRecord),
    /// `record_request_end`
    RequestEnd(RequestRecord, ResponseRecord),
    /// `record_fetch`
    Fetch(FetchRecord, Option<ResponseRecord>),
}

/// Keeps every event in memory, in call order
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    /// Create an empty recorder behind an `Arc`
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the events recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

impl Recorder for MemoryRecorder {
    fn record_request_start(&self, request: &RequestRecord) {
        self.events
            .lock()
            .push(RecordedEvent::RequestStart(request.clone()));
    }

    fn record_request_end(&self, request: &RequestRecord, response: &ResponseRecord) {
        self.events
            .lock()
            .push(RecordedEvent::RequestEnd(request.clone(), response.clone()));
    }

    fn record_fetch(&self, fetch: &FetchRecord, response: Option<&ResponseRecord>) {
        self.events
            .lock()
            .push(RecordedEvent::Fetch(fetch.clone(), response.cloned()));
    }
}
