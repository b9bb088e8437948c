//! Bitget API Type Definitions
//!
//! Wire types for the Bitget v2 REST envelope and the public streaming
//! channel. Numeric market-data fields are carried as decimal strings
//! exactly as the exchange sends them; the gateway never reinterprets them.

use serde::{Deserialize, Serialize};

use crate::error::{classify_business_code, GatewayError, UpstreamError, BUSINESS_CODE_OK};

/// Product type segment this gateway trades in
pub const PRODUCT_TYPE: &str = "USDT-FUTURES";

/// Streaming channel carrying ticker snapshots
pub const TICKER_CHANNEL: &str = "ticker";

/// Standard REST response envelope
///
/// Every Bitget v2 endpoint wraps its payload in
/// `{"code","msg","requestTime","data"}` where `code == "00000"` is success.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub request_time: i64,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Unwraps the payload, converting a non-ok business code into a
    /// structured upstream error
    pub fn into_data(self) -> Result<T, GatewayError> {
        if classify_business_code(&self.code).is_some() {
            return Err(UpstreamError::new(self.code, self.msg).into());
        }
        debug_assert_eq!(self.code, BUSINESS_CODE_OK);
        self.data
            .ok_or_else(|| GatewayError::Unknown("envelope missing data field".to_string()))
    }
}

/// Tradable contract descriptor from `/api/v2/mix/market/contracts`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub symbol: String,
    #[serde(default)]
    pub base_coin: String,
    #[serde(default)]
    pub quote_coin: String,
    #[serde(default)]
    pub symbol_type: String,
    #[serde(default)]
    pub min_trade_num: String,
    #[serde(default)]
    pub price_end_step: String,
    #[serde(default)]
    pub volume_place: String,
    #[serde(default)]
    pub price_place: String,
    #[serde(default)]
    pub maker_fee_rate: String,
    #[serde(default)]
    pub taker_fee_rate: String,
    #[serde(default)]
    pub symbol_status: String,
}

/// One OHLCV row from `/api/v2/mix/market/candles`
///
/// The wire shape is an array `[ts, o, h, l, c, baseVol, quoteVol]`; rows
/// are decoded positionally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub ts: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub base_volume: String,
    pub quote_volume: String,
}

impl TryFrom<Vec<String>> for Candle {
    type Error = GatewayError;

    fn try_from(row: Vec<String>) -> Result<Self, Self::Error> {
        if row.len() < 7 {
            return Err(GatewayError::Unknown(format!(
                "candle row has {} fields, expected 7",
                row.len()
            )));
        }
        let ts = row[0]
            .parse::<i64>()
            .map_err(|_| GatewayError::Unknown(format!("candle timestamp not numeric: {}", row[0])))?;
        let mut row = row.into_iter();
        row.next();
        Ok(Self {
            ts,
            open: row.next().unwrap_or_default(),
            high: row.next().unwrap_or_default(),
            low: row.next().unwrap_or_default(),
            close: row.next().unwrap_or_default(),
            base_volume: row.next().unwrap_or_default(),
            quote_volume: row.next().unwrap_or_default(),
        })
    }
}

/// Ticker snapshot for one symbol
///
/// Shared by the REST ticker endpoint and the streaming ticker channel.
/// All prices and sizes are decimal strings; `ts` is epoch milliseconds as
/// a string, exactly as pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub symbol: String,
    #[serde(default)]
    pub last_pr: String,
    #[serde(default)]
    pub bid_pr: String,
    #[serde(default)]
    pub ask_pr: String,
    #[serde(default)]
    pub bid_sz: String,
    #[serde(default)]
    pub ask_sz: String,
    #[serde(default)]
    pub high24h: String,
    #[serde(default)]
    pub low24h: String,
    #[serde(default)]
    pub base_volume: String,
    #[serde(default)]
    pub quote_volume: String,
    #[serde(default)]
    pub usdt_volume: String,
    #[serde(default)]
    pub index_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub funding_rate: String,
    #[serde(default)]
    pub holding_amount: String,
    #[serde(default)]
    pub ts: String,
}

/// Candle granularities accepted by the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
}

impl Granularity {
    /// All granularities in wire form
    pub const ALL: [&'static str; 10] =
        ["1m", "5m", "15m", "30m", "1H", "4H", "6H", "12H", "1D", "1W"];

    /// Wire representation sent in the query string
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::ThirtyMinutes => "30m",
            Granularity::OneHour => "1H",
            Granularity::FourHours => "4H",
            Granularity::SixHours => "6H",
            Granularity::TwelveHours => "12H",
            Granularity::OneDay => "1D",
            Granularity::OneWeek => "1W",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Granularity::OneMinute),
            "5m" => Ok(Granularity::FiveMinutes),
            "15m" => Ok(Granularity::FifteenMinutes),
            "30m" => Ok(Granularity::ThirtyMinutes),
            "1H" => Ok(Granularity::OneHour),
            "4H" => Ok(Granularity::FourHours),
            "6H" => Ok(Granularity::SixHours),
            "12H" => Ok(Granularity::TwelveHours),
            "1D" => Ok(Granularity::OneDay),
            "1W" => Ok(Granularity::OneWeek),
            other => Err(GatewayError::FatalInput(format!(
                "granularity {} not in {:?}",
                other,
                Granularity::ALL
            ))),
        }
    }
}

/// One subscription target in a stream request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionArg {
    pub inst_type: String,
    pub channel: String,
    pub inst_id: String,
}

impl SubscriptionArg {
    /// Ticker subscription for one symbol
    pub fn ticker(symbol: impl Into<String>) -> Self {
        Self {
            inst_type: PRODUCT_TYPE.to_string(),
            channel: TICKER_CHANNEL.to_string(),
            inst_id: symbol.into(),
        }
    }
}

/// Outbound stream request: `{"op":"subscribe","args":[...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub op: String,
    pub args: Vec<SubscriptionArg>,
}

impl WsRequest {
    pub fn subscribe(args: Vec<SubscriptionArg>) -> Self {
        Self {
            op: "subscribe".to_string(),
            args,
        }
    }

    pub fn unsubscribe(args: Vec<SubscriptionArg>) -> Self {
        Self {
            op: "unsubscribe".to_string(),
            args,
        }
    }
}

/// Control reply to a subscribe/unsubscribe request
#[derive(Debug, Clone, Deserialize)]
pub struct WsEvent {
    pub event: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub arg: Option<SubscriptionArg>,
}

/// Data push carrying a batch of ticker snapshots
#[derive(Debug, Clone, Deserialize)]
pub struct WsPush {
    pub action: String,
    #[serde(default)]
    pub arg: Option<SubscriptionArg>,
    pub data: Vec<TickerData>,
}

/// A decoded upstream frame
///
/// The reader routes every text frame through here: control replies, ticker
/// batches, or anything it does not recognize (logged at debug and dropped).
#[derive(Debug, Clone)]
pub enum UpstreamFrame {
    Event(WsEvent),
    Push(WsPush),
    Unknown(String),
}

impl UpstreamFrame {
    /// Decodes a raw text frame
    ///
    /// Frames with an `event` field are control replies; frames with
    /// `action` + `data` are pushes; everything else is `Unknown`.
    pub fn parse(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return UpstreamFrame::Unknown(text.to_string()),
        };
        if value.get("event").is_some() {
            if let Ok(event) = serde_json::from_value::<WsEvent>(value.clone()) {
                return UpstreamFrame::Event(event);
            }
        }
        if value.get("action").is_some() && value.get("data").is_some() {
            if let Ok(push) = serde_json::from_value::<WsPush>(value) {
                return UpstreamFrame::Push(push);
            }
        }
        UpstreamFrame::Unknown(text.to_string())
    }
}
