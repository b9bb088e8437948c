//! Bitget REST Client
//!
//! Thin typed wrapper over the Bitget v2 mix-market endpoints. Every call
//! takes a token from the shared rate limiter, validates its inputs before
//! touching the network, and unwraps the standard response envelope.

use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;

use crate::bitget::rate_limit::UpstreamRateLimiter;
use crate::bitget::types::{ApiEnvelope, Candle, Contract, Granularity, TickerData, PRODUCT_TYPE};
use crate::error::GatewayError;

/// Hard cap on candle rows per request, enforced by clamping
pub const MAX_CANDLE_LIMIT: u32 = 200;

/// Widest allowed candle time range when both bounds are given
pub const MAX_CANDLE_SPAN_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Bitget REST API client
///
/// Wraps `reqwest::Client` with base-URL handling, a per-request timeout,
/// and token-bucket admission. A backup base URL, when configured, is tried
/// once after a transport-level failure on the primary.
#[derive(Clone)]
pub struct BitgetRestClient {
    client: Client,
    base_url: String,
    backup_url: Option<String>,
    limiter: UpstreamRateLimiter,
    timeout: Duration,
}

impl BitgetRestClient {
    /// Creates a client against `base_url` with the shared rate limiter
    pub fn new(
        base_url: impl Into<String>,
        backup_url: Option<String>,
        timeout: Duration,
        limiter: UpstreamRateLimiter,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ticker-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            backup_url,
            limiter,
            timeout,
        }
    }

    /// Returns the configured primary base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches the tradable contract catalog
    ///
    /// `GET /api/v2/mix/market/contracts?productType=USDT-FUTURES`
    pub async fn list_contracts(&self) -> Result<Vec<Contract>, GatewayError> {
        let query = vec![("productType".to_string(), PRODUCT_TYPE.to_string())];
        let envelope: ApiEnvelope<Vec<Contract>> =
            self.get("/api/v2/mix/market/contracts", &query).await?;
        envelope.into_data()
    }

    /// Fetches OHLCV candles for one symbol
    ///
    /// `GET /api/v2/mix/market/candles`. Validation happens before any
    /// token is taken: empty symbols and unknown granularities fail with
    /// `FatalInput` without issuing a network request; a fully-bounded time
    /// range must satisfy `start < end` and span at most 30 days. `limit`
    /// is clamped to 200.
    pub async fn get_candles(
        &self,
        symbol: &str,
        granularity: &str,
        range: Option<(i64, i64)>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, GatewayError> {
        if symbol.is_empty() {
            return Err(GatewayError::FatalInput("symbol must not be empty".to_string()));
        }
        let granularity = Granularity::from_str(granularity)?;
        if let Some((start, end)) = range {
            if start >= end {
                return Err(GatewayError::FatalInput(format!(
                    "startTime {} must precede endTime {}",
                    start, end
                )));
            }
            if end - start > MAX_CANDLE_SPAN_MS {
                return Err(GatewayError::FatalInput(
                    "candle range must not exceed 30 days".to_string(),
                ));
            }
        }
        let limit = limit.unwrap_or(MAX_CANDLE_LIMIT).min(MAX_CANDLE_LIMIT);

        let mut query = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("granularity".to_string(), granularity.as_str().to_string()),
            ("productType".to_string(), PRODUCT_TYPE.to_string()),
        ];
        if let Some((start, end)) = range {
            query.push(("startTime".to_string(), start.to_string()));
            query.push(("endTime".to_string(), end.to_string()));
        }
        query.push(("limit".to_string(), limit.to_string()));

        let envelope: ApiEnvelope<Vec<Vec<String>>> =
            self.get("/api/v2/mix/market/candles", &query).await?;
        envelope
            .into_data()?
            .into_iter()
            .map(Candle::try_from)
            .collect()
    }

    /// Fetches the most recent ticker snapshot for one symbol
    ///
    /// `GET /api/v2/mix/market/ticker?symbol=<>&productType=USDT-FUTURES`
    pub async fn get_ticker(&self, symbol: &str) -> Result<TickerData, GatewayError> {
        if symbol.is_empty() {
            return Err(GatewayError::FatalInput("symbol must not be empty".to_string()));
        }
        let query = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("productType".to_string(), PRODUCT_TYPE.to_string()),
        ];
        let envelope: ApiEnvelope<Vec<TickerData>> =
            self.get("/api/v2/mix/market/ticker", &query).await?;
        envelope
            .into_data()?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Unknown("ticker response carried no rows".to_string()))
    }

    /// Shared request path: token, dispatch, status check, decode
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, GatewayError> {
        self.limiter.acquire(self.timeout).await?;

        let response = match self.dispatch(&self.base_url, path, query).await {
            Ok(resp) => resp,
            Err(err) if self.backup_url.is_some() && err.is_retryable() => {
                let backup = self.backup_url.as_deref().unwrap();
                tracing::warn!(error = %err, backup = %backup, "primary REST URL failed, trying backup");
                self.dispatch(backup, path, query).await?
            }
            Err(err) => return Err(err),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::from_kind(
                crate::error::classify_http_status(status.as_u16()),
                format!("upstream returned HTTP {} for {}", status.as_u16(), path),
            ));
        }
        Ok(response.json::<T>().await?)
    }

    async fn dispatch(
        &self,
        base: &str,
        path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}{}", base, path);
        tracing::debug!(url = %url, "dispatching upstream REST request");
        Ok(self.client.get(&url).query(query).send().await?)
    }
}
