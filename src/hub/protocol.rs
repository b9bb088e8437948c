//! Downstream Wire Protocol
//!
//! JSON messages exchanged with downstream WebSocket clients. Inbound
//! frames are subscribe/unsubscribe/ping requests; outbound frames are
//! acknowledgements, pongs, error reports and ticker pushes. Every
//! outbound frame is stamped with epoch milliseconds.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bitget::types::TickerData;
use crate::error::ErrorKind;

/// Symbols are uppercase alphanumerics, bounded length, compared byte-exact
static SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{1,30}$").expect("symbol regex must compile"));

/// Validates a downstream-supplied symbol before it reaches the index
pub fn is_valid_symbol(symbol: &str) -> bool {
    SYMBOL_RE.is_match(symbol)
}

/// Message from a downstream client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Message to a downstream client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SubscribeSuccess {
        symbols: Vec<String>,
        timestamp: i64,
    },
    UnsubscribeSuccess {
        symbols: Vec<String>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        timestamp: i64,
    },
    Ticker {
        symbol: String,
        data: TickerData,
        timestamp: i64,
    },
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ServerMessage {
    pub fn subscribe_success(symbols: Vec<String>) -> Self {
        ServerMessage::SubscribeSuccess {
            symbols,
            timestamp: now_ms(),
        }
    }

    pub fn unsubscribe_success(symbols: Vec<String>) -> Self {
        ServerMessage::UnsubscribeSuccess {
            symbols,
            timestamp: now_ms(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: now_ms() }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: kind.code().to_string(),
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn ticker(data: TickerData) -> Self {
        ServerMessage::Ticker {
            symbol: data.symbol.clone(),
            data,
            timestamp: now_ms(),
        }
    }

    /// Serializes to the wire; outbound frames are always encodable
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server message serialization cannot fail")
    }
}
