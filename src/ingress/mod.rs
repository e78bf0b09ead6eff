pub mod auth;
pub mod rate_limit;
pub mod server;

pub use server::{build_router, serve, HealthStatus, PushServerConfig, MAX_BODY_BYTES};
