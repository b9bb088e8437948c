//! Client-side rate limiter for upstream REST requests
//!
//! A single token bucket shared across all REST calls, implemented with the
//! governor crate (GCRA). Parameterised by refill rate (tokens/second) and
//! burst capacity; callers block on `acquire` up to their own deadline.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use tokio::time::timeout;

use crate::error::GatewayError;

/// Token-bucket admission for upstream REST calls
///
/// `acquire` either returns with a token or fails with `Cancelled` when the
/// caller's deadline expires; it never returns a hard denial.
#[derive(Clone)]
pub struct UpstreamRateLimiter {
    inner: Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl UpstreamRateLimiter {
    /// Create a limiter refilling `tokens_per_second` with `burst` capacity
    ///
    /// ## Panics
    ///
    /// Panics if either parameter is 0; configuration validation rejects
    /// those values before construction.
    pub fn new(tokens_per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(tokens_per_second).expect("rate limit tps must be greater than 0"),
        )
        .allow_burst(NonZeroU32::new(burst).expect("rate limit burst must be greater than 0"));

        Self {
            inner: Arc::new(GovernorRateLimiter::direct(quota)),
        }
    }

    /// Block until a token is available or the deadline passes
    ///
    /// Returns `Cancelled` when `deadline` elapses first; the request must
    /// not be dispatched in that case.
    pub async fn acquire(&self, deadline: Duration) -> Result<(), GatewayError> {
        match timeout(deadline, self.inner.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::debug!(deadline_ms = deadline.as_millis() as u64, "rate limiter wait cancelled");
                Err(GatewayError::Cancelled)
            }
        }
    }

    /// Non-blocking probe, used by tests and the stats endpoint
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}
