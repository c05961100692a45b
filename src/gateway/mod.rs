//! Gateway server implementation

pub mod auth;
pub mod cookies;
pub mod proxy;
mod router;
mod server;

pub use auth::{Identity, Rejection, auth_middleware, validate};
pub use proxy::{Forwarder, ProxyError};
pub use router::{AppState, create_router};
pub use server::Gateway;
