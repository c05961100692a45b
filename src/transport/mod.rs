//! Outbound transports
//!
//! - [`BoundedClient`]: deadline-bound JSON calls to the user directory and
//!   the backend login endpoint.
//! - [`BackendTransport`]: the keep-alive connection pool the reverse proxy
//!   uses, selected once from the backend URL scheme.

mod http;

pub use http::{BackendTransport, BoundedClient, FetchedResponse};
