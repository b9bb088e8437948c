//! HTTP and WebSocket Server
//!
//! The downstream surface: `/ws` for the streaming protocol, a small REST
//! passthrough for reference data, `/health` and `/api/v1/stats`.
//!
//! ## Architecture
//!
//! - `routes/`: REST endpoint handlers
//! - `middleware/`: rate limiting, CORS
//! - `ws`: the `/ws` upgrade handler and per-connection tasks

pub mod middleware;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
use middleware::{check_rate_limit, create_cors_layer, HttpRateLimiter};

/// Shared state for every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub rest_limiter: HttpRateLimiter,
}

/// Builds the downstream router with middleware applied
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    let rest_limiter = HttpRateLimiter::new(gateway.config().downstream.rest_rate_limit);
    let state = AppState {
        gateway,
        rest_limiter: rest_limiter.clone(),
    };

    // REST passthrough sits behind the process-wide request limit so
    // downstream callers cannot drain the upstream token bucket.
    let api = Router::new()
        .route("/contracts", get(routes::market_data::get_contracts))
        .route("/ticker", get(routes::market_data::get_ticker))
        .route("/candles", get(routes::market_data::get_candles))
        .route("/stats", get(routes::stats::get_stats))
        .layer(axum::middleware::from_fn_with_state(
            rest_limiter,
            check_rate_limit,
        ));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws::ws_handler))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}
