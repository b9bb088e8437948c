//! Rate Limiting Middleware
//!
//! Limits REST passthrough requests per process so downstream callers
//! cannot burn the upstream token bucket through the gateway.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Error type for rate limit exceeded
#[derive(Debug, Clone, Copy)]
pub struct RateLimitExceeded;

/// Process-wide request limiter for the REST passthrough routes
///
/// ## Configuration
///
/// Limit comes from `HTTP_RATE_LIMIT` (default: 100 req/min), applied
/// across all clients.
#[derive(Clone)]
pub struct HttpRateLimiter {
    inner: Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl HttpRateLimiter {
    /// Create a new rate limiter with specified requests per minute
    ///
    /// ## Panics
    ///
    /// Panics if `requests_per_minute` is 0
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute).expect("Rate limit must be greater than 0"),
        );

        Self {
            inner: Arc::new(GovernorRateLimiter::direct(quota)),
        }
    }

    /// Check if a request is allowed
    pub fn check(&self) -> Result<(), RateLimitExceeded> {
        self.inner.check().map_err(|_| RateLimitExceeded)
    }
}

/// axum middleware: reject with 429 once the quota is spent
pub async fn check_rate_limit(
    axum::extract::State(limiter): axum::extract::State<HttpRateLimiter>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, axum::http::StatusCode> {
    if limiter.check().is_err() {
        return Err(axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}
