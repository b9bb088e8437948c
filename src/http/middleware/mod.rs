//! HTTP middleware: CORS and request rate limiting

pub mod cors;
pub mod rate_limit;

pub use cors::create_cors_layer;
pub use rate_limit::{check_rate_limit, HttpRateLimiter};
