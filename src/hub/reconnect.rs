//! Reconnect Controller
//!
//! Per-connection backoff state machines for peers the gateway reconnects
//! to on their behalf, plus the connection-state snapshot store consulted
//! when a link comes back. Backoff strategies are shared with the upstream
//! stream client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::error::GatewayError;
use crate::hub::subscriptions::SubscriptionIndex;

/// Backoff strategy for repeated connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Delay grows by one base interval per attempt
    Linear,
    /// Delay multiplies per attempt, capped at the max interval
    Exponential,
    /// Constant delay
    Fixed,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!(
                "unknown reconnect strategy {:?} (expected linear, exponential or fixed)",
                other
            )),
        }
    }
}

/// Concrete backoff parameters: strategy plus base/cap/growth/jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Linear => base_ms * (attempt as f64 + 1.0),
            BackoffStrategy::Exponential => base_ms * self.multiplier.powi(attempt.min(32) as i32),
            BackoffStrategy::Fixed => base_ms,
        };
        let capped_ms = raw_ms.min(self.max.as_millis() as f64);
        let final_ms = if self.jitter {
            use rand::Rng;
            capped_ms * rand::thread_rng().gen_range(0.9..=1.1)
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms as u64)
    }
}

/// Observable reconnect state for one connection (or the upstream link)
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectStatus {
    /// Attempts made since the last successful connect
    pub attempts: u32,
    /// Interval chosen for the pending attempt, in milliseconds
    pub current_interval_ms: u64,
    /// When the next attempt is due
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Lifetime totals
    pub total_attempted: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
}

/// Snapshot of a connection written on disconnect, read on reconnect
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub conn_id: String,
    pub subscriptions: Vec<String>,
    pub last_message_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub custom: HashMap<String, String>,
}

struct StoredSnapshot {
    state: ConnectionState,
    saved_at: Instant,
}

/// In-memory snapshot store with TTL eviction
pub struct SnapshotStore {
    entries: Mutex<HashMap<String, StoredSnapshot>>,
    ttl: Duration,
}

impl SnapshotStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Writes (or replaces) the snapshot for a connection
    pub fn save(&self, state: ConnectionState) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            state.conn_id.clone(),
            StoredSnapshot {
                state,
                saved_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the snapshot, honouring the TTL
    pub fn take(&self, conn_id: &str) -> Option<ConnectionState> {
        let mut entries = self.entries.lock().unwrap();
        let stored = entries.remove(conn_id)?;
        if stored.saved_at.elapsed() > self.ttl {
            return None;
        }
        Some(stored.state)
    }

    /// Drops the snapshot without reading it (permanent close)
    pub fn remove(&self, conn_id: &str) {
        self.entries.lock().unwrap().remove(conn_id);
    }

    /// Evicts every expired snapshot, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, stored| stored.saved_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Async connection attempt invoked by the reconnect worker
pub type ReconnectFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), GatewayError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Reconnecting,
}

struct ConnTrack {
    status: ReconnectStatus,
    phase: Phase,
    auto: bool,
}

/// Per-connection reconnect state machines plus the snapshot store
///
/// Connections opt in to auto-reconnect when tracked; on disconnect a job
/// is queued and a single worker walks the backoff schedule. Snapshots are
/// saved for every tracked connection regardless of opt-in, so state can be
/// restored whichever side re-establishes the link.
pub struct ReconnectController {
    policy: BackoffPolicy,
    max_attempts: u32,
    states: Mutex<HashMap<String, ConnTrack>>,
    store: SnapshotStore,
    jobs_tx: mpsc::UnboundedSender<String>,
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    index: Arc<SubscriptionIndex>,
}

impl ReconnectController {
    pub fn new(config: &ReconnectConfig, index: Arc<SubscriptionIndex>) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Self {
            policy: BackoffPolicy {
                strategy: config.strategy,
                base: config.interval,
                max: config.max_interval,
                multiplier: config.backoff_multiplier,
                jitter: config.jitter,
            },
            max_attempts: config.max_attempts,
            states: Mutex::new(HashMap::new()),
            store: SnapshotStore::new(config.snapshot_ttl),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            index,
        }
    }

    /// Begins tracking a connection; `auto` opts it into reconnect jobs
    pub fn track(&self, conn_id: &str, auto: bool) {
        let mut states = self.states.lock().unwrap();
        states.insert(
            conn_id.to_string(),
            ConnTrack {
                status: ReconnectStatus {
                    last_connected_at: Some(Utc::now()),
                    ..ReconnectStatus::default()
                },
                phase: Phase::Connected,
                auto,
            },
        );
    }

    /// Stops tracking and drops any saved snapshot (permanent close)
    pub fn untrack(&self, conn_id: &str) {
        self.states.lock().unwrap().remove(conn_id);
        self.store.remove(conn_id);
    }

    /// Stops tracking but leaves the snapshot to age out via TTL
    ///
    /// Used for plain downstream clients: the gateway does not redial
    /// them, but a returning client inside the TTL window can have its
    /// state restored.
    pub fn release(&self, conn_id: &str) {
        self.states.lock().unwrap().remove(conn_id);
    }

    /// Records a disconnect, saves the snapshot, and schedules a reconnect
    /// job when the connection opted in and has attempts left
    pub fn on_disconnected(&self, snapshot: ConnectionState) {
        let conn_id = snapshot.conn_id.clone();
        self.store.save(snapshot);

        let mut states = self.states.lock().unwrap();
        let Some(track) = states.get_mut(&conn_id) else {
            return;
        };
        track.status.last_disconnected_at = Some(Utc::now());
        if track.phase == Phase::Reconnecting {
            // A schedule is already in flight for this disconnect.
            return;
        }
        if track.auto && track.status.attempts < self.max_attempts {
            track.phase = Phase::Reconnecting;
            if self.jobs_tx.send(conn_id.clone()).is_err() {
                tracing::warn!(conn_id = %conn_id, "reconnect worker gone, dropping job");
            }
        }
    }

    /// Reconnect status snapshot for one connection
    pub fn status(&self, conn_id: &str) -> Option<ReconnectStatus> {
        self.states
            .lock()
            .unwrap()
            .get(conn_id)
            .map(|track| track.status.clone())
    }

    /// The shared snapshot store
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs the reconnect worker until cancelled
    ///
    /// One job at a time: sleep out the backoff interval, invoke the
    /// attempt, restore state on success or requeue on failure until the
    /// attempt budget is exhausted. Expired snapshots are evicted on a
    /// timer sharing the same loop.
    pub async fn run(&self, cancel: CancellationToken, reconnector: ReconnectFn) {
        let mut jobs_rx = self
            .jobs_rx
            .lock()
            .unwrap()
            .take()
            .expect("reconnect worker started twice");
        let mut evict_tick = tokio::time::interval(self.store.ttl.max(Duration::from_secs(1)));
        evict_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("reconnect worker stopping");
                    return;
                }
                _ = evict_tick.tick() => {
                    let evicted = self.store.evict_expired();
                    if evicted > 0 {
                        tracing::debug!(evicted, "evicted expired connection snapshots");
                    }
                }
                job = jobs_rx.recv() => {
                    let Some(conn_id) = job else { return };
                    self.process_job(&cancel, &reconnector, conn_id).await;
                }
            }
        }
    }

    async fn process_job(
        &self,
        cancel: &CancellationToken,
        reconnector: &ReconnectFn,
        conn_id: String,
    ) {
        let delay = {
            let mut states = self.states.lock().unwrap();
            let Some(track) = states.get_mut(&conn_id) else {
                return;
            };
            let delay = self.policy.delay(track.status.attempts);
            track.status.current_interval_ms = delay.as_millis() as u64;
            track.status.next_attempt_at =
                Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            delay
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut states = self.states.lock().unwrap();
            if let Some(track) = states.get_mut(&conn_id) {
                track.status.total_attempted += 1;
            }
        }

        match reconnector(conn_id.clone()).await {
            Ok(()) => {
                self.restore(&conn_id);
                let mut states = self.states.lock().unwrap();
                if let Some(track) = states.get_mut(&conn_id) {
                    track.status.attempts = 0;
                    track.status.total_succeeded += 1;
                    track.status.next_attempt_at = None;
                    track.status.last_connected_at = Some(Utc::now());
                    track.phase = Phase::Connected;
                }
                tracing::info!(conn_id = %conn_id, "reconnected downstream peer");
            }
            Err(err) => {
                let requeue = {
                    let mut states = self.states.lock().unwrap();
                    match states.get_mut(&conn_id) {
                        Some(track) => {
                            track.status.attempts += 1;
                            track.status.total_failed += 1;
                            track.status.attempts < self.max_attempts
                        }
                        None => false,
                    }
                };
                if requeue {
                    tracing::warn!(conn_id = %conn_id, error = %err, "reconnect attempt failed, requeueing");
                    let _ = self.jobs_tx.send(conn_id);
                } else {
                    tracing::warn!(conn_id = %conn_id, error = %err, "reconnect attempts exhausted");
                    let mut states = self.states.lock().unwrap();
                    if let Some(track) = states.get_mut(&conn_id) {
                        track.phase = Phase::Connected;
                    }
                }
            }
        }
    }

    /// Replays the saved snapshot through the subscription index
    fn restore(&self, conn_id: &str) {
        let Some(state) = self.store.take(conn_id) else {
            return;
        };
        self.index.add_conn(conn_id);
        if !state.subscriptions.is_empty() {
            if let Err(err) = self.index.subscribe(conn_id, &state.subscriptions) {
                tracing::warn!(conn_id = %conn_id, error = %err, "failed to replay subscriptions");
            }
        }
        tracing::debug!(
            conn_id = %conn_id,
            symbols = state.subscriptions.len(),
            "restored connection state"
        );
    }
}
