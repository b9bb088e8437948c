//! Broadcast Engine
//!
//! Fan-out core: two bounded FIFO queues (priority and main) drained by a
//! fixed worker pool. Workers always drain the priority queue first, fetch
//! the subscriber set at dispatch time, and retry failed per-recipient
//! deliveries onto the priority queue until the retry budget runs out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BroadcastConfig;
use crate::error::GatewayError;
use crate::hub::registry::ConnectionRegistry;
use crate::hub::subscriptions::SubscriptionIndex;

/// EWMA decay for enqueue-to-dispatch latency
const EWMA_ALPHA: f64 = 0.2;

/// How a broadcast message is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// Fan out to every subscriber of `symbol`
    SymbolBroadcast,
    /// Fan out to every live connection
    All,
    /// Deliver to exactly one connection
    Unicast,
}

/// One queued fan-out unit
///
/// Immutable once enqueued except for `retry_count`, which the engine
/// bumps when it requeues a failed per-recipient delivery.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub id: String,
    pub kind: BroadcastKind,
    pub symbol: Option<String>,
    pub target: Option<String>,
    pub payload: String,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub priority: u8,
}

/// Counters exposed on the stats surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    /// Enqueued broadcast operations (counted at enqueue)
    pub total_broadcasts: u64,
    /// Per-recipient deliveries that succeeded
    pub successful: u64,
    /// Per-recipient deliveries dropped after exhausting retries
    pub failed: u64,
    /// EWMA of enqueue-to-dispatch latency
    pub avg_latency_ms: f64,
    /// Live queue depth (priority + main)
    pub queue_depth: usize,
    pub last_broadcast_at: Option<DateTime<Utc>>,
    /// Enqueued symbol broadcasts per symbol
    pub per_symbol: HashMap<String, u64>,
}

/// Priority queue plus one or more main queues
///
/// With symbol routing off there is a single main queue every worker
/// drains. With routing on there is one main queue per worker and a
/// symbol always hashes to the same queue, which preserves per-symbol
/// delivery order at the cost of cross-worker balance.
struct Queues {
    priority: Mutex<VecDeque<BroadcastMessage>>,
    mains: Vec<Mutex<VecDeque<BroadcastMessage>>>,
}

#[derive(Default)]
struct Counters {
    total_broadcasts: u64,
    successful: u64,
    failed: u64,
    avg_latency_ms: f64,
    last_broadcast_at: Option<DateTime<Utc>>,
    per_symbol: HashMap<String, u64>,
}

/// Priority-aware bounded fan-out engine over the registry and index
pub struct BroadcastEngine {
    queues: Queues,
    /// One wakeup handle per worker; permits are stored, so a busy worker
    /// checks its queues again before sleeping
    wakeups: Vec<tokio::sync::Notify>,
    /// Capacity of each main queue
    main_capacity: usize,
    priority_capacity: usize,
    max_retries: u32,
    retry_delay: Duration,
    workers: usize,
    batch_size: usize,
    running: AtomicBool,
    next_id: AtomicU64,
    counters: Mutex<Counters>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_cancel: Mutex<Option<CancellationToken>>,
    index: Arc<SubscriptionIndex>,
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastEngine {
    pub fn new(
        config: &BroadcastConfig,
        index: Arc<SubscriptionIndex>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let main_queues = if config.route_by_symbol {
            config.workers.max(1)
        } else {
            1
        };
        Self {
            queues: Queues {
                priority: Mutex::new(VecDeque::new()),
                mains: (0..main_queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            },
            wakeups: (0..config.workers).map(|_| tokio::sync::Notify::new()).collect(),
            main_capacity: (config.max_queue_size / main_queues).max(1),
            priority_capacity: (config.max_queue_size / 2).max(1),
            max_retries: config.retry_attempts,
            retry_delay: config.retry_delay,
            workers: config.workers,
            batch_size: config.batch_size,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Mutex::new(Counters::default()),
            handles: Mutex::new(Vec::new()),
            worker_cancel: Mutex::new(None),
            index,
            registry,
        }
    }

    /// Launches the worker pool
    ///
    /// Fails with `AlreadyRunning` on a second start. Workers stop when
    /// `parent` (the orchestrator context) or `stop` fires.
    pub fn start(self: Arc<Self>, parent: &CancellationToken) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyRunning);
        }
        let cancel = parent.child_token();
        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..self.workers {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id, cancel).await;
            }));
        }
        *self.worker_cancel.lock().unwrap() = Some(cancel);
        tracing::info!(workers = self.workers, "broadcast engine started");
        Ok(())
    }

    /// Stops the workers, waiting up to `drain` for them to finish
    ///
    /// Idempotent: a second stop is a no-op.
    pub async fn stop(&self, drain: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.worker_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(drain, join_all).await.is_err() {
            tracing::warn!(drain_ms = drain.as_millis() as u64, "broadcast workers did not drain in time");
        }
        tracing::info!("broadcast engine stopped");
    }

    /// Enqueues a fan-out to every subscriber of `symbol`
    ///
    /// Fast path: returns `NoSubscribers` without enqueueing when the
    /// symbol has no subscribers at call time. Returns `QueueFull` when
    /// the bounded main queue cannot accept the message.
    pub fn broadcast_to_symbol(
        &self,
        symbol: &str,
        payload: impl Into<String>,
    ) -> Result<String, GatewayError> {
        self.ensure_running()?;
        if !self.index.has_subscribers(symbol) {
            return Err(GatewayError::NoSubscribers(symbol.to_string()));
        }
        let message = self.build_message(
            BroadcastKind::SymbolBroadcast,
            Some(symbol.to_string()),
            None,
            payload.into(),
            1,
        );
        self.enqueue(message)
    }

    /// Enqueues one symbol broadcast per payload, up to the batch size
    ///
    /// Each entry takes the same fast path and bounded enqueue as
    /// `broadcast_to_symbol`; results are reported per entry.
    pub fn broadcast_batch(
        &self,
        entries: Vec<(String, String)>,
    ) -> Vec<Result<String, GatewayError>> {
        entries
            .into_iter()
            .take(self.batch_size)
            .map(|(symbol, payload)| self.broadcast_to_symbol(&symbol, payload))
            .collect()
    }

    /// Enqueues a fan-out to every live connection
    pub fn broadcast_all(&self, payload: impl Into<String>) -> Result<String, GatewayError> {
        self.ensure_running()?;
        let message = self.build_message(BroadcastKind::All, None, None, payload.into(), 2);
        self.enqueue(message)
    }

    /// Enqueues a targeted delivery on the priority queue
    pub fn send_to_connection(
        &self,
        conn_id: &str,
        payload: impl Into<String>,
    ) -> Result<String, GatewayError> {
        self.ensure_running()?;
        let message = self.build_message(
            BroadcastKind::Unicast,
            None,
            Some(conn_id.to_string()),
            payload.into(),
            0,
        );
        self.enqueue(message)
    }

    /// Counter snapshot plus a live queue-depth probe
    pub fn stats(&self) -> BroadcastStats {
        let counters = self.counters.lock().unwrap();
        BroadcastStats {
            total_broadcasts: counters.total_broadcasts,
            successful: counters.successful,
            failed: counters.failed,
            avg_latency_ms: counters.avg_latency_ms,
            queue_depth: self.queue_depth(),
            last_broadcast_at: counters.last_broadcast_at,
            per_symbol: counters.per_symbol.clone(),
        }
    }

    fn queue_depth(&self) -> usize {
        let mut depth = self.queues.priority.lock().unwrap().len();
        for main in &self.queues.mains {
            depth += main.lock().unwrap().len();
        }
        depth
    }

    /// Queue index a symbol's broadcasts are pinned to
    fn route_index(&self, symbol: Option<&str>) -> usize {
        if self.queues.mains.len() == 1 {
            return 0;
        }
        match symbol {
            Some(symbol) => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                symbol.hash(&mut hasher);
                (hasher.finish() as usize) % self.queues.mains.len()
            }
            None => 0,
        }
    }

    fn wake_all(&self) {
        for wakeup in &self.wakeups {
            wakeup.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), GatewayError> {
        if !self.is_running() {
            return Err(GatewayError::NotRunning);
        }
        Ok(())
    }

    fn build_message(
        &self,
        kind: BroadcastKind,
        symbol: Option<String>,
        target: Option<String>,
        payload: String,
        priority: u8,
    ) -> BroadcastMessage {
        BroadcastMessage {
            id: format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            kind,
            symbol,
            target,
            payload,
            enqueued_at: Instant::now(),
            retry_count: 0,
            priority,
        }
    }

    /// Non-blocking bounded enqueue; counters update only on acceptance
    fn enqueue(&self, message: BroadcastMessage) -> Result<String, GatewayError> {
        let id = message.id.clone();
        let symbol = message.symbol.clone();
        if message.priority == 0 {
            let mut priority = self.queues.priority.lock().unwrap();
            if priority.len() >= self.priority_capacity {
                return Err(GatewayError::QueueFull);
            }
            priority.push_back(message);
            drop(priority);
            // Any worker may take priority work.
            self.wake_all();
        } else {
            let index = self.route_index(message.symbol.as_deref());
            let mut main = self.queues.mains[index].lock().unwrap();
            if main.len() >= self.main_capacity {
                return Err(GatewayError::QueueFull);
            }
            main.push_back(message);
            drop(main);
            if self.queues.mains.len() == 1 {
                self.wake_all();
            } else {
                // Routed: exactly one worker owns this queue.
                self.wakeups[index].notify_one();
            }
        }
        {
            let mut counters = self.counters.lock().unwrap();
            counters.total_broadcasts += 1;
            counters.last_broadcast_at = Some(Utc::now());
            if let Some(symbol) = symbol {
                *counters.per_symbol.entry(symbol).or_insert(0) += 1;
            }
        }
        Ok(id)
    }

    /// Priority-first pop; each worker drains its own main queue
    fn pop(&self, worker_id: usize) -> Option<BroadcastMessage> {
        if let Some(message) = self.queues.priority.lock().unwrap().pop_front() {
            return Some(message);
        }
        let index = worker_id % self.queues.mains.len();
        self.queues.mains[index].lock().unwrap().pop_front()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!(worker_id, "broadcast worker started");
        loop {
            match self.pop(worker_id) {
                Some(message) => self.dispatch(message).await,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(worker_id, "broadcast worker stopping");
                            return;
                        }
                        _ = self.wakeups[worker_id].notified() => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: BroadcastMessage) {
        self.observe_latency(message.enqueued_at);
        match message.kind {
            BroadcastKind::SymbolBroadcast => {
                let symbol = message.symbol.as_deref().unwrap_or_default();
                // Delivery goes to whoever is subscribed at dispatch time.
                let subscribers = self.index.subscribers(symbol);
                for conn_id in subscribers {
                    if !self.registry.is_active(&conn_id) {
                        continue;
                    }
                    self.deliver(&message, &conn_id).await;
                }
            }
            BroadcastKind::All => {
                for conn_id in self.registry.list() {
                    if !self.registry.is_active(&conn_id) {
                        continue;
                    }
                    self.deliver(&message, &conn_id).await;
                }
            }
            BroadcastKind::Unicast => {
                let Some(conn_id) = message.target.clone() else {
                    tracing::warn!(id = %message.id, "unicast message without target dropped");
                    return;
                };
                self.deliver(&message, &conn_id).await;
            }
        }
    }

    /// One per-recipient delivery with retry-or-drop bookkeeping
    async fn deliver(&self, message: &BroadcastMessage, conn_id: &str) {
        let frame = Message::Text(message.payload.clone().into());
        match self.registry.send_to(conn_id, frame).await {
            Ok(()) => {
                self.counters.lock().unwrap().successful += 1;
            }
            Err(err) => {
                tracing::debug!(
                    id = %message.id,
                    conn_id = %conn_id,
                    error = %err,
                    retry = message.retry_count,
                    "delivery failed"
                );
                self.handle_failure(message, conn_id).await;
            }
        }
    }

    /// Requeues a failed delivery as a unicast on the priority queue, or
    /// counts it as failed once the retry budget is spent (or the queue
    /// cannot take it)
    async fn handle_failure(&self, message: &BroadcastMessage, conn_id: &str) {
        if message.retry_count < self.max_retries {
            tokio::time::sleep(self.retry_delay).await;
            let retry = BroadcastMessage {
                id: message.id.clone(),
                kind: BroadcastKind::Unicast,
                symbol: message.symbol.clone(),
                target: Some(conn_id.to_string()),
                payload: message.payload.clone(),
                enqueued_at: message.enqueued_at,
                retry_count: message.retry_count + 1,
                priority: 0,
            };
            let pushed = {
                let mut priority = self.queues.priority.lock().unwrap();
                if priority.len() >= self.priority_capacity {
                    false
                } else {
                    priority.push_back(retry);
                    true
                }
            };
            if pushed {
                self.wake_all();
                return;
            }
        }
        self.counters.lock().unwrap().failed += 1;
    }

    fn observe_latency(&self, enqueued_at: Instant) {
        let sample_ms = enqueued_at.elapsed().as_secs_f64() * 1_000.0;
        let mut counters = self.counters.lock().unwrap();
        counters.avg_latency_ms = if counters.avg_latency_ms == 0.0 {
            sample_ms
        } else {
            EWMA_ALPHA * sample_ms + (1.0 - EWMA_ALPHA) * counters.avg_latency_ms
        };
    }
}
