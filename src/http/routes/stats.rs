//! Gateway Statistics Endpoint
//!
//! GET /api/v1/stats exposes the orchestrator's aggregate view: upstream
//! link state, index and broadcast counters, heartbeat health.

use axum::{extract::State, Json};

use crate::error::GatewayError;
use crate::http::AppState;

/// GET /api/v1/stats - Aggregated gateway statistics
pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let stats = state.gateway.stats();
    Ok(Json(serde_json::to_value(stats)?))
}
