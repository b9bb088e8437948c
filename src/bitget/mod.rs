//! Bitget Upstream Integration
//!
//! REST client, streaming client, shared rate limiting and the v2 wire
//! types for the USDT-FUTURES public market-data surface.

pub mod client;
pub mod rate_limit;
pub mod stream;
pub mod types;

pub use client::BitgetRestClient;
pub use rate_limit::UpstreamRateLimiter;
pub use stream::{TickerCallback, UpstreamStreamClient};
pub use types::{Candle, Contract, Granularity, TickerData};
