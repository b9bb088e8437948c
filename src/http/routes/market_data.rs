//! Market Data REST Passthrough
//!
//! Thin HTTP endpoints over the upstream REST client:
//! - GET /api/v1/contracts - Tradable contract catalog
//! - GET /api/v1/ticker - Latest ticker snapshot for a symbol
//! - GET /api/v1/candles - OHLCV candles

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::http::AppState;

/// Query parameters for the ticker endpoint
#[derive(Debug, Deserialize)]
pub struct TickerQuery {
    /// Contract symbol (e.g., "BTCUSDT")
    pub symbol: String,
}

/// Query parameters for the candles endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlesQuery {
    /// Contract symbol (e.g., "BTCUSDT")
    pub symbol: String,
    /// Candle granularity (e.g., "1m", "1H", "1D")
    pub granularity: String,
    /// Range start in epoch milliseconds
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Range end in epoch milliseconds
    #[serde(default)]
    pub end_time: Option<i64>,
    /// Row cap, clamped to 200
    #[serde(default)]
    pub limit: Option<u32>,
}

/// GET /api/v1/contracts - List tradable contracts
pub async fn get_contracts(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    tracing::info!("GET /api/v1/contracts");

    let contracts = state.gateway.rest.list_contracts().await?;
    Ok(Json(serde_json::json!({ "contracts": contracts })))
}

/// GET /api/v1/ticker - Latest snapshot for a symbol
pub async fn get_ticker(
    State(state): State<AppState>,
    Query(params): Query<TickerQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    tracing::info!("GET /api/v1/ticker symbol={}", params.symbol);

    if params.symbol.is_empty() {
        return Err(GatewayError::FatalInput(
            "symbol parameter is required".to_string(),
        ));
    }

    let ticker = state.gateway.rest.get_ticker(&params.symbol).await?;
    Ok(Json(serde_json::to_value(ticker)?))
}

/// GET /api/v1/candles - OHLCV candles for a symbol
pub async fn get_candles(
    State(state): State<AppState>,
    Query(params): Query<CandlesQuery>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    tracing::info!(
        "GET /api/v1/candles symbol={} granularity={} limit={:?}",
        params.symbol,
        params.granularity,
        params.limit
    );

    let range = match (params.start_time, params.end_time) {
        (Some(start), Some(end)) => Some((start, end)),
        (None, None) => None,
        _ => {
            return Err(GatewayError::FatalInput(
                "startTime and endTime must be given together".to_string(),
            ))
        }
    };

    let candles = state
        .gateway
        .rest
        .get_candles(&params.symbol, &params.granularity, range, params.limit)
        .await?;
    Ok(Json(serde_json::json!({ "candles": candles })))
}
