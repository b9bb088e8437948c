//! Configuration Management
//!
//! Loads the gateway configuration tree from environment variables with
//! sensible defaults. Configuration is a value type threaded from `main`;
//! there are no process-wide mutable singletons.

use std::time::Duration;

use crate::error::GatewayError;
use crate::hub::reconnect::BackoffStrategy;

/// Upstream (Bitget) connectivity settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Primary WebSocket stream URL
    pub stream_url: String,
    /// Fallback stream URL tried when the primary refuses the dial
    pub stream_backup_url: Option<String>,
    /// Primary REST base URL
    pub rest_url: String,
    /// Fallback REST base URL
    pub rest_backup_url: Option<String>,
    /// Per-request REST timeout
    pub timeout: Duration,
    /// Token-bucket refill rate for REST calls (tokens/second)
    pub rate_limit_tps: u32,
    /// Token-bucket capacity
    pub rate_limit_burst: u32,
    /// Interval between outbound stream pings
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the link dead
    pub pong_timeout: Duration,
    /// Reconnect attempts before the stream client gives up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
    /// Exit at startup when the upstream is unreachable
    pub fail_fast: bool,
}

/// Downstream (client-facing) listener settings
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// TCP port for the HTTP/WebSocket listener
    pub port: u16,
    /// Maximum simultaneous downstream connections
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes
    pub read_limit: usize,
    /// Deadline for a single outbound frame write
    pub write_wait: Duration,
    /// Interval between heartbeat pings to downstream clients
    pub ping_interval: Duration,
    /// How long a client may go without a pong before being marked stale
    pub pong_wait: Duration,
    /// Missed heartbeats tolerated before a connection is marked inactive
    pub max_missed_heartbeats: u32,
    /// REST passthrough rate limit (requests/minute, process-wide)
    pub rest_rate_limit: u32,
}

/// Broadcast engine settings
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Worker pool size
    pub workers: usize,
    /// Main queue capacity; the priority queue gets half of this
    pub max_queue_size: usize,
    /// Per-recipient delivery retries before a message is dropped
    pub retry_attempts: u32,
    /// Pause between delivery retries
    pub retry_delay: Duration,
    /// Messages accepted per batch-enqueue call
    pub batch_size: usize,
    /// Pin each symbol to one worker so its ticks are delivered in order
    pub route_by_symbol: bool,
}

/// Downstream reconnect controller settings
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff strategy: linear, exponential or fixed
    pub strategy: BackoffStrategy,
    /// Base interval between attempts
    pub interval: Duration,
    /// Interval cap
    pub max_interval: Duration,
    /// Growth factor for the exponential strategy
    pub backoff_multiplier: f64,
    /// Apply +/-10% jitter to computed delays
    pub jitter: bool,
    /// Attempts before a connection is abandoned
    pub max_attempts: u32,
    /// How long connection-state snapshots are retained
    pub snapshot_ttl: Duration,
}

/// Root configuration threaded from `main`
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    pub downstream: DownstreamConfig,
    pub broadcast: BroadcastConfig,
    pub reconnect: ReconnectConfig,
}

const DEFAULT_STREAM_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const DEFAULT_REST_URL: &str = "https://api.bitget.com";

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, GatewayError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| GatewayError::FatalInput(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration, GatewayError> {
    Ok(Duration::from_millis(env_parse(key, default_ms)?))
}

impl GatewayConfig {
    /// Loads the configuration tree from environment variables
    ///
    /// Every key has a default; parse failures surface as `FatalInput` so
    /// `main` can exit with the configuration error code.
    pub fn from_env() -> Result<Self, GatewayError> {
        let upstream = UpstreamConfig {
            stream_url: env_string("UPSTREAM_STREAM_URL", DEFAULT_STREAM_URL),
            stream_backup_url: env_opt("UPSTREAM_STREAM_BACKUP_URL"),
            rest_url: env_string("UPSTREAM_REST_URL", DEFAULT_REST_URL),
            rest_backup_url: env_opt("UPSTREAM_REST_BACKUP_URL"),
            timeout: env_millis("UPSTREAM_TIMEOUT_MS", 10_000)?,
            rate_limit_tps: env_parse("UPSTREAM_RATE_LIMIT_TPS", 10)?,
            rate_limit_burst: env_parse("UPSTREAM_RATE_LIMIT_BURST", 1)?,
            ping_interval: env_millis("UPSTREAM_PING_INTERVAL_MS", 30_000)?,
            pong_timeout: env_millis("UPSTREAM_PONG_TIMEOUT_MS", 60_000)?,
            max_reconnect_attempts: env_parse("UPSTREAM_MAX_RECONNECT_ATTEMPTS", 10)?,
            reconnect_base_delay: env_millis("UPSTREAM_RECONNECT_BASE_DELAY_MS", 1_000)?,
            reconnect_max_delay: env_millis("UPSTREAM_RECONNECT_MAX_DELAY_MS", 30_000)?,
            fail_fast: env_parse("UPSTREAM_FAIL_FAST", false)?,
        };

        let downstream = DownstreamConfig {
            port: env_parse("DOWNSTREAM_PORT", 8080u16)?,
            max_connections: env_parse("DOWNSTREAM_MAX_CONNECTIONS", 1_024usize)?,
            read_limit: env_parse("DOWNSTREAM_READ_LIMIT", 64 * 1024usize)?,
            write_wait: env_millis("DOWNSTREAM_WRITE_WAIT_MS", 10_000)?,
            ping_interval: env_millis("DOWNSTREAM_PING_INTERVAL_MS", 30_000)?,
            pong_wait: env_millis("DOWNSTREAM_PONG_WAIT_MS", 60_000)?,
            max_missed_heartbeats: env_parse("DOWNSTREAM_MAX_MISSED_HEARTBEATS", 3u32)?,
            rest_rate_limit: env_parse("HTTP_RATE_LIMIT", 100u32)?,
        };

        let broadcast = BroadcastConfig {
            workers: env_parse("BROADCAST_WORKERS", 4usize)?,
            max_queue_size: env_parse("BROADCAST_MAX_QUEUE_SIZE", 1_024usize)?,
            retry_attempts: env_parse("BROADCAST_RETRY_ATTEMPTS", 3u32)?,
            retry_delay: env_millis("BROADCAST_RETRY_DELAY_MS", 100)?,
            batch_size: env_parse("BROADCAST_BATCH_SIZE", 100usize)?,
            route_by_symbol: env_parse("BROADCAST_ROUTE_BY_SYMBOL", false)?,
        };

        let strategy: BackoffStrategy = env_string("RECONNECT_STRATEGY", "exponential")
            .parse()
            .map_err(GatewayError::FatalInput)?;
        let reconnect = ReconnectConfig {
            strategy,
            interval: env_millis("RECONNECT_INTERVAL_MS", 1_000)?,
            max_interval: env_millis("RECONNECT_MAX_INTERVAL_MS", 30_000)?,
            backoff_multiplier: env_parse("RECONNECT_BACKOFF_MULTIPLIER", 2.0f64)?,
            jitter: env_parse("RECONNECT_JITTER", false)?,
            max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", 5u32)?,
            snapshot_ttl: env_millis("RECONNECT_SNAPSHOT_TTL_MS", 300_000)?,
        };

        let config = Self {
            upstream,
            downstream,
            broadcast,
            reconnect,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot run
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.upstream.rate_limit_tps == 0 {
            return Err(GatewayError::FatalInput(
                "UPSTREAM_RATE_LIMIT_TPS must be at least 1".to_string(),
            ));
        }
        if self.upstream.rate_limit_burst == 0 {
            return Err(GatewayError::FatalInput(
                "UPSTREAM_RATE_LIMIT_BURST must be at least 1".to_string(),
            ));
        }
        if self.upstream.pong_timeout <= self.upstream.ping_interval {
            return Err(GatewayError::FatalInput(
                "UPSTREAM_PONG_TIMEOUT_MS must exceed UPSTREAM_PING_INTERVAL_MS".to_string(),
            ));
        }
        if self.downstream.max_connections == 0 {
            return Err(GatewayError::FatalInput(
                "DOWNSTREAM_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.downstream.pong_wait <= self.downstream.ping_interval {
            return Err(GatewayError::FatalInput(
                "DOWNSTREAM_PONG_WAIT_MS must exceed DOWNSTREAM_PING_INTERVAL_MS".to_string(),
            ));
        }
        if self.broadcast.workers == 0 {
            return Err(GatewayError::FatalInput(
                "BROADCAST_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.broadcast.max_queue_size < 2 {
            return Err(GatewayError::FatalInput(
                "BROADCAST_MAX_QUEUE_SIZE must be at least 2".to_string(),
            ));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(GatewayError::FatalInput(
                "RECONNECT_BACKOFF_MULTIPLIER must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    /// Default configuration matching the documented environment defaults
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                stream_url: DEFAULT_STREAM_URL.to_string(),
                stream_backup_url: None,
                rest_url: DEFAULT_REST_URL.to_string(),
                rest_backup_url: None,
                timeout: Duration::from_secs(10),
                rate_limit_tps: 10,
                rate_limit_burst: 1,
                ping_interval: Duration::from_secs(30),
                pong_timeout: Duration::from_secs(60),
                max_reconnect_attempts: 10,
                reconnect_base_delay: Duration::from_secs(1),
                reconnect_max_delay: Duration::from_secs(30),
                fail_fast: false,
            },
            downstream: DownstreamConfig {
                port: 8080,
                max_connections: 1_024,
                read_limit: 64 * 1024,
                write_wait: Duration::from_secs(10),
                ping_interval: Duration::from_secs(30),
                pong_wait: Duration::from_secs(60),
                max_missed_heartbeats: 3,
                rest_rate_limit: 100,
            },
            broadcast: BroadcastConfig {
                workers: 4,
                max_queue_size: 1_024,
                retry_attempts: 3,
                retry_delay: Duration::from_millis(100),
                batch_size: 100,
                route_by_symbol: false,
            },
            reconnect: ReconnectConfig {
                strategy: BackoffStrategy::Exponential,
                interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                jitter: false,
                max_attempts: 5,
                snapshot_ttl: Duration::from_secs(300),
            },
        }
    }
}
