//! Error Types and Classification
//!
//! Defines the gateway-wide error taxonomy and the upstream error classifier.
//! Every fallible operation in the gateway returns [`GatewayError`]; the
//! classifier maps Bitget business codes and HTTP transport statuses onto the
//! taxonomy so retry policy can be decided uniformly by the caller.

use std::time::Duration;
use thiserror::Error;

/// Coarse error classification shared by every component.
///
/// Retry policy hangs off the kind, not the concrete error: `Transient`,
/// `RateLimited` and `Maintenance` are retriable, everything else is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Temporary upstream failure, safe to retry immediately
    Transient,
    /// Upstream asked us to slow down, retry after a delay
    RateLimited,
    /// Credentials or signature rejected, retrying cannot help
    FatalAuth,
    /// The request itself is malformed, retrying cannot help
    FatalInput,
    /// Upstream is in a maintenance window, retry later
    Maintenance,
    /// Streaming operation attempted while not connected
    NotConnected,
    /// Outbound write did not complete within the write deadline
    WriteTimeout,
    /// Bounded broadcast queue rejected the enqueue
    QueueFull,
    /// Referenced connection id is unknown
    NotFound,
    /// Referenced connection exists but is marked inactive
    Inactive,
    /// Symbol broadcast requested with no subscribers
    NoSubscribers,
    /// Component start requested while already running
    AlreadyRunning,
    /// Component operation requested before start
    NotRunning,
    /// Caller context expired or shutdown began
    Cancelled,
    /// Anything the classifier could not place, not retriable
    Unknown,
}

impl ErrorKind {
    /// Returns true if this kind should trigger retry logic
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Maintenance
        )
    }

    /// Wire-stable identifier used in downstream error frames
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::FatalAuth => "fatal_auth",
            ErrorKind::FatalInput => "fatal_input",
            ErrorKind::Maintenance => "maintenance",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::WriteTimeout => "write_timeout",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Inactive => "inactive",
            ErrorKind::NoSubscribers => "no_subscribers",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Main error type for the ticker gateway
///
/// Messages are user-facing: they never contain credentials or internal
/// state, only enough context to act on the failure.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Temporary upstream or transport failure
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Upstream rate limit tripped (business code 50001 or HTTP 429)
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Authentication rejected by the upstream
    #[error("upstream rejected credentials: {0}")]
    FatalAuth(String),

    /// Request parameters invalid, locally or per the upstream
    #[error("invalid input: {0}")]
    FatalInput(String),

    /// Upstream maintenance window
    #[error("upstream under maintenance: {0}")]
    Maintenance(String),

    /// Streaming operation attempted while the upstream link is down
    #[error("not connected to upstream")]
    NotConnected,

    /// Outbound write missed its deadline
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Bounded broadcast queue is full
    #[error("broadcast queue full")]
    QueueFull,

    /// Unknown downstream connection id
    #[error("connection not found: {0}")]
    NotFound(String),

    /// Downstream connection is tracked but no longer active
    #[error("connection inactive: {0}")]
    Inactive(String),

    /// Symbol has no subscribers, nothing was enqueued
    #[error("no subscribers for symbol {0}")]
    NoSubscribers(String),

    /// Start called on a running component
    #[error("already running")]
    AlreadyRunning,

    /// Operation attempted on a stopped component
    #[error("not running")]
    NotRunning,

    /// Operation cancelled by context expiry or shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Unclassified failure, not retriable
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl GatewayError {
    /// The taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Transient(_) => ErrorKind::Transient,
            GatewayError::RateLimited(_) => ErrorKind::RateLimited,
            GatewayError::FatalAuth(_) => ErrorKind::FatalAuth,
            GatewayError::FatalInput(_) => ErrorKind::FatalInput,
            GatewayError::Maintenance(_) => ErrorKind::Maintenance,
            GatewayError::NotConnected => ErrorKind::NotConnected,
            GatewayError::WriteTimeout(_) => ErrorKind::WriteTimeout,
            GatewayError::QueueFull => ErrorKind::QueueFull,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Inactive(_) => ErrorKind::Inactive,
            GatewayError::NoSubscribers(_) => ErrorKind::NoSubscribers,
            GatewayError::AlreadyRunning => ErrorKind::AlreadyRunning,
            GatewayError::NotRunning => ErrorKind::NotRunning,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Returns true if this error should trigger retry logic
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Builds the taxonomy variant matching `kind` with the given message
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transient => GatewayError::Transient(message),
            ErrorKind::RateLimited => GatewayError::RateLimited(message),
            ErrorKind::FatalAuth => GatewayError::FatalAuth(message),
            ErrorKind::FatalInput => GatewayError::FatalInput(message),
            ErrorKind::Maintenance => GatewayError::Maintenance(message),
            ErrorKind::NotConnected => GatewayError::NotConnected,
            ErrorKind::WriteTimeout => GatewayError::WriteTimeout(Duration::ZERO),
            ErrorKind::QueueFull => GatewayError::QueueFull,
            ErrorKind::NotFound => GatewayError::NotFound(message),
            ErrorKind::Inactive => GatewayError::Inactive(message),
            ErrorKind::NoSubscribers => GatewayError::NoSubscribers(message),
            ErrorKind::AlreadyRunning => GatewayError::AlreadyRunning,
            ErrorKind::NotRunning => GatewayError::NotRunning,
            ErrorKind::Cancelled => GatewayError::Cancelled,
            ErrorKind::Unknown => GatewayError::Unknown(message),
        }
    }
}

/// Structured error returned by the upstream REST envelope
///
/// Carries the raw business code alongside the classified kind so callers
/// can log the exact upstream response while branching on `retryable`.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    /// Raw Bitget business code (e.g. "40001")
    pub code: String,
    /// Human-readable message from the envelope
    pub message: String,
    /// Whether the classified kind permits a retry
    pub retryable: bool,
    kind: ErrorKind,
}

impl UpstreamError {
    /// Classifies a non-ok envelope into a structured error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = classify_business_code(&code).unwrap_or(ErrorKind::Unknown);
        Self {
            message: message.into(),
            retryable: kind.is_retryable(),
            kind,
            code,
        }
    }

    /// The taxonomy kind this business code maps to
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        GatewayError::from_kind(err.kind, format!("code {}: {}", err.code, err.message))
    }
}

/// Bitget business code success sentinel
pub const BUSINESS_CODE_OK: &str = "00000";

/// Maps a Bitget business code to an error kind
///
/// Returns `None` for the success code `00000`. Codes outside the fixed
/// table classify as `Unknown` (not retriable).
pub fn classify_business_code(code: &str) -> Option<ErrorKind> {
    match code {
        BUSINESS_CODE_OK => None,
        "40001" | "40002" => Some(ErrorKind::FatalInput),
        "40003" | "40004" | "40005" => Some(ErrorKind::FatalAuth),
        "40006" | "40007" | "40008" => Some(ErrorKind::FatalInput),
        "50000" => Some(ErrorKind::Transient),
        "50001" => Some(ErrorKind::RateLimited),
        "50002" => Some(ErrorKind::Maintenance),
        _ => Some(ErrorKind::Unknown),
    }
}

/// Maps an HTTP transport status to an error kind
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::FatalAuth,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Unknown,
    }
}

// Error conversions from common error types
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Transient("request timed out".to_string())
        } else if err.is_connect() {
            GatewayError::Transient("failed to reach the upstream REST API".to_string())
        } else if let Some(status) = err.status() {
            GatewayError::from_kind(
                classify_http_status(status.as_u16()),
                format!("upstream returned HTTP {}", status.as_u16()),
            )
        } else {
            GatewayError::Transient(format!("network error: {}", err))
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Unknown(format!("failed to decode upstream response: {}", err))
    }
}

// HTTP response conversion for the axum passthrough routes
impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;
        use serde_json::json;

        let status = match self.kind() {
            ErrorKind::FatalInput | ErrorKind::NotFound => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::FatalAuth => StatusCode::FORBIDDEN,
            ErrorKind::NotConnected | ErrorKind::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };

        let body = Json(json!({
            "error": {
                "type": self.kind().code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
