//! HTTP gateway for channel webhooks.
//!
//! Serves the provider handshake and event deliveries on each registered webhook path,
//! the rate-limited `<path>/api/pair` approval endpoint, and `/healthz`.

mod api_error;
pub mod rate_limit;
mod webhook_server;

pub use api_error::GatewayApiError;
pub use rate_limit::{FixedWindowRateLimiter, RateLimitDecision};
pub use webhook_server::{
    build_gateway_router, run_gateway_server, serve_gateway, GatewayServerConfig,
    GatewayServerState, HEALTHZ_ENDPOINT, PAIR_API_SUBPATH,
};
