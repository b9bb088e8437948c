//! Heartbeat Supervisor
//!
//! Sends periodic pings to every downstream connection, tracks pongs and
//! missed heartbeats, and marks stale connections inactive so broadcasts
//! skip them. Response times feed an EWMA so the stats surface can report
//! downstream latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::hub::registry::ConnectionRegistry;

/// EWMA decay for response-time samples: new = 0.2 * sample + 0.8 * old
const EWMA_ALPHA: f64 = 0.2;

/// Heartbeat bookkeeping for one connection
#[derive(Debug, Clone, Default)]
struct HeartbeatRecord {
    last_ping_sent: Option<Instant>,
    /// First ping still waiting for a pong; the timeout window anchors
    /// here, not at the most recent ping
    pending_since: Option<Instant>,
    total_pings: u64,
    total_pongs: u64,
    missed: u32,
    avg_response_ms: f64,
    inactive_since: Option<Instant>,
}

/// Aggregate heartbeat counters for the stats surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatStats {
    pub tracked: usize,
    pub total_pings: u64,
    pub total_pongs: u64,
    pub stale: usize,
    pub avg_response_ms: f64,
}

/// Supervisor configuration, derived from the downstream config block
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Ping cadence
    pub interval: Duration,
    /// How long after a ping a pong must arrive
    pub pong_timeout: Duration,
    /// Misses tolerated before a connection is dropped
    pub max_missed: u32,
    /// How long an inactive record is kept before being forgotten
    pub cleanup_after: Duration,
}

/// Periodic liveness prober for downstream connections
pub struct HeartbeatSupervisor {
    registry: Arc<ConnectionRegistry>,
    records: Mutex<HashMap<String, HeartbeatRecord>>,
    config: HeartbeatConfig,
}

impl HeartbeatSupervisor {
    pub fn new(registry: Arc<ConnectionRegistry>, config: HeartbeatConfig) -> Self {
        Self {
            registry,
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Starts tracking a connection
    pub fn track(&self, conn_id: &str) {
        self.records
            .lock()
            .unwrap()
            .insert(conn_id.to_string(), HeartbeatRecord::default());
    }

    /// Stops tracking a connection (closed or handed off)
    pub fn forget(&self, conn_id: &str) {
        self.records.lock().unwrap().remove(conn_id);
    }

    /// Records a pong from the transport
    ///
    /// Resets the missed counter and folds the response time into the EWMA.
    pub fn record_pong(&self, conn_id: &str) {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(conn_id) else {
            return;
        };
        record.total_pongs += 1;
        record.missed = 0;
        record.pending_since = None;
        if let Some(sent) = record.last_ping_sent {
            let sample_ms = now.saturating_duration_since(sent).as_secs_f64() * 1_000.0;
            record.avg_response_ms = if record.avg_response_ms == 0.0 {
                sample_ms
            } else {
                EWMA_ALPHA * sample_ms + (1.0 - EWMA_ALPHA) * record.avg_response_ms
            };
        }
        drop(records);
        self.registry.record_pong(conn_id);
    }

    /// Runs ping ticks and record cleanup until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ping_tick = tokio::time::interval(self.config.interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(self.config.cleanup_after.max(Duration::from_secs(1)));
        cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("heartbeat supervisor stopping");
                    return;
                }
                _ = ping_tick.tick() => self.tick().await,
                _ = cleanup_tick.tick() => self.cleanup(),
            }
        }
    }

    /// One supervision pass: timeout check, then ping every tracked
    /// connection, dropping those that exhausted their miss budget
    pub async fn tick(&self) {
        let now = Instant::now();
        let targets: Vec<String> = {
            let mut records = self.records.lock().unwrap();
            for record in records.values_mut() {
                if let Some(since) = record.pending_since {
                    if now.saturating_duration_since(since) > self.config.pong_timeout {
                        record.missed += 1;
                        // Restart the window so each further miss costs a
                        // full pong timeout.
                        record.pending_since = Some(now);
                    }
                }
            }
            records.keys().cloned().collect()
        };

        for conn_id in targets {
            let send_result = self
                .registry
                .send_to(&conn_id, Message::Ping(Vec::new().into()))
                .await;

            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(&conn_id) else {
                continue;
            };
            match send_result {
                Ok(()) => {
                    record.total_pings += 1;
                    record.last_ping_sent = Some(Instant::now());
                    if record.pending_since.is_none() {
                        record.pending_since = record.last_ping_sent;
                    }
                }
                Err(err) => {
                    record.missed += 1;
                    tracing::debug!(conn_id = %conn_id, error = %err, "heartbeat ping undeliverable");
                }
            }
            if record.missed >= self.config.max_missed && record.inactive_since.is_none() {
                record.inactive_since = Some(Instant::now());
                drop(records);
                tracing::info!(conn_id = %conn_id, "connection missed heartbeats, dropping");
                self.registry.mark_inactive(&conn_id);
                self.registry.close(&conn_id, Some("heartbeat timeout"));
            }
        }
    }

    /// Drops records for connections inactive beyond the cleanup window
    pub fn cleanup(&self) {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        let window = self.config.cleanup_after;
        records.retain(|_, record| {
            record
                .inactive_since
                .map(|since| since.elapsed() <= window)
                .unwrap_or(true)
        });
        let dropped = before - records.len();
        if dropped > 0 {
            tracing::debug!(dropped, "cleaned up stale heartbeat records");
        }
    }

    /// Missed-heartbeat count for one connection (observability)
    pub fn missed(&self, conn_id: &str) -> Option<u32> {
        self.records.lock().unwrap().get(conn_id).map(|r| r.missed)
    }

    /// Aggregate counters
    pub fn stats(&self) -> HeartbeatStats {
        let records = self.records.lock().unwrap();
        let tracked = records.len();
        let mut stats = HeartbeatStats {
            tracked,
            ..HeartbeatStats::default()
        };
        let mut response_sum = 0.0;
        let mut response_count = 0usize;
        for record in records.values() {
            stats.total_pings += record.total_pings;
            stats.total_pongs += record.total_pongs;
            if record.inactive_since.is_some() {
                stats.stale += 1;
            }
            if record.avg_response_ms > 0.0 {
                response_sum += record.avg_response_ms;
                response_count += 1;
            }
        }
        if response_count > 0 {
            stats.avg_response_ms = response_sum / response_count as f64;
        }
        stats
    }
}
