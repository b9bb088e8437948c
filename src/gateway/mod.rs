//! Gateway Orchestrator
//!
//! Wires the upstream clients to the downstream hub: brings the broadcast
//! engine, heartbeat supervisor, reconnect controller and stream client up
//! in order, bridges ticker callbacks into symbol broadcasts, and keeps
//! the upstream subscription set covering the union of all downstream
//! subscriptions via reference counts held under the index lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bitget::rate_limit::UpstreamRateLimiter;
use crate::bitget::stream::{TickerCallback, UpstreamStreamClient};
use crate::bitget::types::TickerData;
use crate::bitget::BitgetRestClient;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::hub::broadcast::{BroadcastEngine, BroadcastStats};
use crate::hub::heartbeat::{HeartbeatConfig, HeartbeatStats, HeartbeatSupervisor};
use crate::hub::protocol::{is_valid_symbol, ServerMessage};
use crate::hub::reconnect::{ConnectionState, ReconnectController, ReconnectFn, ReconnectStatus};
use crate::hub::registry::ConnectionRegistry;
use crate::hub::subscriptions::{IndexStats, SubscriptionIndex};

/// How long `shutdown` waits for broadcast workers to drain
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Point-in-time view of the whole gateway for the stats route
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub upstream_connected: bool,
    pub upstream_reconnect: ReconnectStatus,
    pub upstream_symbols: usize,
    pub connections: usize,
    pub index: IndexStats,
    pub broadcast: BroadcastStats,
    pub heartbeat: HeartbeatStats,
}

/// Top-level component graph
///
/// Owns every long-lived component and the root cancellation token their
/// tasks derive from. Shutdown runs top-down: stream client first, then
/// the broadcast engine, then the supervisors, then the registry.
pub struct Gateway {
    config: GatewayConfig,
    pub index: Arc<SubscriptionIndex>,
    pub registry: Arc<ConnectionRegistry>,
    pub heartbeat: Arc<HeartbeatSupervisor>,
    pub reconnect: Arc<ReconnectController>,
    pub broadcast: Arc<BroadcastEngine>,
    pub upstream: UpstreamStreamClient,
    pub rest: BitgetRestClient,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Gateway {
    /// Builds the component graph from configuration; nothing runs yet
    pub fn new(config: GatewayConfig) -> Self {
        let index = Arc::new(SubscriptionIndex::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.downstream.max_connections,
            config.downstream.write_wait,
        ));
        let heartbeat = Arc::new(HeartbeatSupervisor::new(
            registry.clone(),
            HeartbeatConfig {
                interval: config.downstream.ping_interval,
                pong_timeout: config.downstream.pong_wait,
                max_missed: config.downstream.max_missed_heartbeats,
                cleanup_after: config.downstream.pong_wait * 4,
            },
        ));
        let reconnect = Arc::new(ReconnectController::new(&config.reconnect, index.clone()));
        let broadcast = Arc::new(BroadcastEngine::new(
            &config.broadcast,
            index.clone(),
            registry.clone(),
        ));
        let upstream = UpstreamStreamClient::new(&config.upstream);
        let limiter = UpstreamRateLimiter::new(
            config.upstream.rate_limit_tps,
            config.upstream.rate_limit_burst,
        );
        let rest = BitgetRestClient::new(
            config.upstream.rest_url.clone(),
            config.upstream.rest_backup_url.clone(),
            config.upstream.timeout,
            limiter,
        );

        Self {
            config,
            index,
            registry,
            heartbeat,
            reconnect,
            broadcast,
            upstream,
            rest,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Root cancellation token; component tasks hold children of it
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Brings the gateway up: broadcast engine, heartbeat supervisor,
    /// reconnect worker, then the upstream stream
    ///
    /// With `fail_fast` set an unreachable upstream aborts startup;
    /// otherwise the dial keeps retrying in the background while the
    /// downstream side starts serving.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyRunning);
        }

        self.broadcast.clone().start(&self.cancel)?;

        let heartbeat = self.heartbeat.clone();
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(async move { heartbeat.run(heartbeat_cancel).await });

        let reconnect = self.reconnect.clone();
        let reconnect_cancel = self.cancel.child_token();
        let reconnector = self.peer_reconnector();
        tokio::spawn(async move { reconnect.run(reconnect_cancel, reconnector).await });

        match self.upstream.connect().await {
            Ok(()) => {}
            Err(err) if self.config.upstream.fail_fast => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "upstream unreachable at start, retrying in background");
                self.spawn_initial_connect_retry();
            }
        }

        tracing::info!("gateway started");
        Ok(())
    }

    /// Top-down shutdown; idempotent
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("gateway shutting down");
        self.upstream.close().await;
        self.broadcast.stop(SHUTDOWN_DRAIN).await;
        self.cancel.cancel();
        self.registry.close_all();
    }

    /// Accepts a new downstream connection into every subsystem
    pub fn on_connect(&self, conn_id: &str) {
        self.index.add_conn(conn_id);
        self.heartbeat.track(conn_id);
        self.reconnect.track(conn_id, false);
        tracing::info!(conn_id = %conn_id, "downstream connected");
    }

    /// Subscribes a downstream connection to `symbols`
    ///
    /// Symbols failing validation reject the whole request. When one of
    /// them gains its first subscriber the upstream subscription set grows
    /// by exactly that symbol; a disconnected upstream leaves the index
    /// and callback in place (replay covers them) but fails the request
    /// with `NotConnected` so the client hears about the degraded mode.
    pub async fn handle_subscribe(
        &self,
        conn_id: &str,
        symbols: &[String],
    ) -> Result<(), GatewayError> {
        if symbols.is_empty() {
            return Err(GatewayError::FatalInput("symbols must not be empty".to_string()));
        }
        if let Some(bad) = symbols.iter().find(|s| !is_valid_symbol(s)) {
            return Err(GatewayError::FatalInput(format!("invalid symbol: {}", bad)));
        }

        let newly_active = self.index.subscribe(conn_id, symbols)?;
        if newly_active.is_empty() {
            return Ok(());
        }
        self.upstream
            .subscribe_ticker(&newly_active, self.ticker_callback())
            .await
    }

    /// Unsubscribes a downstream connection from `symbols`
    ///
    /// Symbols losing their last subscriber are released upstream.
    pub async fn handle_unsubscribe(
        &self,
        conn_id: &str,
        symbols: &[String],
    ) -> Result<(), GatewayError> {
        if symbols.is_empty() {
            return Err(GatewayError::FatalInput("symbols must not be empty".to_string()));
        }
        let emptied = self.index.unsubscribe(conn_id, symbols)?;
        if emptied.is_empty() {
            return Ok(());
        }
        self.upstream.unsubscribe(&emptied).await
    }

    /// Removes a downstream connection from every subsystem
    ///
    /// The connection state is snapshotted before removal so a returning
    /// client inside the TTL window can be restored; symbols left without
    /// subscribers are released upstream.
    pub async fn on_disconnect(&self, conn_id: &str) {
        let snapshot = ConnectionState {
            conn_id: conn_id.to_string(),
            subscriptions: self.index.subscriptions(conn_id),
            last_message_id: None,
            last_activity: chrono::Utc::now(),
            custom: HashMap::new(),
        };
        self.reconnect.on_disconnected(snapshot);
        self.reconnect.release(conn_id);

        let emptied = self.index.remove_conn(conn_id);
        if !emptied.is_empty() {
            if let Err(err) = self.upstream.unsubscribe(&emptied).await {
                tracing::warn!(error = %err, "failed to release upstream symbols");
            }
        }
        self.heartbeat.forget(conn_id);
        self.registry.close(conn_id, None);
        tracing::info!(conn_id = %conn_id, released = emptied.len(), "downstream disconnected");
    }

    /// Aggregated gateway statistics
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            upstream_connected: self.upstream.is_connected(),
            upstream_reconnect: self.upstream.reconnect_status(),
            upstream_symbols: self.upstream.subscribed_symbols().len(),
            connections: self.registry.count(),
            index: self.index.stats(),
            broadcast: self.broadcast.stats(),
            heartbeat: self.heartbeat.stats(),
        }
    }

    /// The single ticker callback registered with the stream client
    ///
    /// Runs on the reader task: serialize the push once, enqueue a symbol
    /// broadcast, and absorb fan-out backpressure without blocking the
    /// reader.
    pub fn ticker_callback(&self) -> TickerCallback {
        let broadcast = self.broadcast.clone();
        Arc::new(move |ticker: TickerData| {
            let symbol = ticker.symbol.clone();
            let payload = ServerMessage::ticker(ticker).to_json();
            match broadcast.broadcast_to_symbol(&symbol, payload) {
                Ok(_) => {}
                Err(GatewayError::NoSubscribers(_)) => {
                    tracing::trace!(symbol = %symbol, "tick for symbol with no subscribers");
                }
                Err(GatewayError::QueueFull) => {
                    tracing::warn!(symbol = %symbol, "broadcast queue full, dropping tick");
                }
                Err(err) => {
                    tracing::warn!(symbol = %symbol, error = %err, "failed to enqueue tick");
                }
            }
        })
    }

    /// Reconnect attempt for downstream peers: succeeds when the peer has
    /// re-registered, so the controller can restore its saved state
    fn peer_reconnector(&self) -> ReconnectFn {
        let registry = self.registry.clone();
        Arc::new(move |conn_id: String| {
            let registry = registry.clone();
            Box::pin(async move {
                if registry.is_active(&conn_id) {
                    Ok(())
                } else {
                    Err(GatewayError::NotConnected)
                }
            })
        })
    }

    /// Background dial loop for a fail-slow start
    fn spawn_initial_connect_retry(&self) {
        let upstream = self.upstream.clone();
        let delay = self.config.upstream.reconnect_base_delay;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match upstream.connect().await {
                    Ok(()) => {
                        tracing::info!("upstream reachable, initial connection established");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "upstream still unreachable");
                    }
                }
            }
        });
    }
}
