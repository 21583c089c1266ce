//! HTTP surface: `/auth`, `/healthz`, and the authenticated reverse proxy

pub mod auth;
pub mod proxy;
mod router;
mod server;

pub use auth::{ASSERTION_HEADER, EMAIL_HEADER, SUBJECT_HEADER, authenticate};
pub use proxy::{DEFAULT_EMAIL_HEADER, ProxyForwarder};
pub use router::{AppState, create_router};
pub use server::{BoundGateway, Gateway};
