//! Bitget Streaming Client
//!
//! Single-owner client for the Bitget v2 public WebSocket. Once connected
//! it runs three cooperative tasks: a reader that decodes frames and
//! dispatches ticker callbacks, a writer that drains a bounded outbound
//! queue and emits pings, and a heartbeat watchdog that kills the link
//! when pongs stop arriving. Disconnects funnel into one reconnect
//! schedule that replays the accumulated subscription set on success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::bitget::types::{SubscriptionArg, TickerData, UpstreamFrame, WsRequest};
use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::hub::reconnect::{BackoffPolicy, BackoffStrategy, ReconnectStatus};

/// Callback invoked once per decoded ticker, serially on the reader task
pub type TickerCallback = Arc<dyn Fn(TickerData) + Send + Sync>;

/// Outbound queue depth between callers and the writer task
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// How long a subscribe/unsubscribe waits for queue space
const WRITE_QUEUE_WAIT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection parameters for the streaming client
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub backup_url: Option<String>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_wait: Duration,
    pub max_reconnect_attempts: u32,
}

impl StreamSettings {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            url: config.stream_url.clone(),
            backup_url: config.stream_backup_url.clone(),
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            write_wait: Duration::from_secs(10).min(config.timeout.max(Duration::from_secs(1))),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Reconnect bookkeeping guarded by its own mutex, so scheduling can
/// proceed while the main client state is briefly held by `close`
struct ReconnectGuard {
    attempts: u32,
    pending: bool,
    enabled: bool,
}

struct Inner {
    /// Connected flag and liveness instant take the read-write variant:
    /// they are read on every frame and every watchdog tick.
    connected: RwLock<bool>,
    last_pong: RwLock<Instant>,
    subscribers: Mutex<HashMap<String, TickerCallback>>,
    outbound: Mutex<Option<mpsc::Sender<WsMessage>>>,
    reconnect: Mutex<ReconnectGuard>,
    status: Mutex<ReconnectStatus>,
    root_cancel: CancellationToken,
    closed: AtomicBool,
}

/// Persistent upstream streaming client with auto-reconnect
#[derive(Clone)]
pub struct UpstreamStreamClient {
    settings: Arc<StreamSettings>,
    policy: Arc<BackoffPolicy>,
    inner: Arc<Inner>,
}

impl UpstreamStreamClient {
    /// Builds a client from the upstream config block
    ///
    /// The reconnect schedule defaults to linear backoff capped at ten
    /// base delays (or the configured maximum, whichever is lower).
    pub fn new(config: &UpstreamConfig) -> Self {
        let policy = BackoffPolicy {
            strategy: BackoffStrategy::Linear,
            base: config.reconnect_base_delay,
            max: config.reconnect_max_delay.min(config.reconnect_base_delay * 10),
            multiplier: 2.0,
            jitter: false,
        };
        Self::with_policy(StreamSettings::from_config(config), policy)
    }

    /// Builds a client with an explicit backoff policy
    pub fn with_policy(settings: StreamSettings, policy: BackoffPolicy) -> Self {
        Self {
            settings: Arc::new(settings),
            policy: Arc::new(policy),
            inner: Arc::new(Inner {
                connected: RwLock::new(false),
                last_pong: RwLock::new(Instant::now()),
                subscribers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                reconnect: Mutex::new(ReconnectGuard {
                    attempts: 0,
                    pending: false,
                    enabled: true,
                }),
                status: Mutex::new(ReconnectStatus::default()),
                root_cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Dials the upstream and starts the connection tasks
    ///
    /// Connect failures surface to the caller; every later fault is
    /// absorbed by the reconnect state machine.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Cancelled);
        }
        if self.is_connected() {
            return Ok(());
        }
        self.dial().await?;
        // Callbacks registered while the link was down are replayed here,
        // so a late first connect still honours them.
        if let Err(err) = self.replay_subscriptions().await {
            tracing::warn!(error = %err, "subscription replay failed");
        }
        Ok(())
    }

    /// True while the link is established
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.read().unwrap()
    }

    /// Snapshot of the reconnect bookkeeping
    pub fn reconnect_status(&self) -> ReconnectStatus {
        self.inner.status.lock().unwrap().clone()
    }

    /// Enables or disables automatic reconnection
    pub fn set_reconnect_enabled(&self, enabled: bool) {
        self.inner.reconnect.lock().unwrap().enabled = enabled;
    }

    /// Symbols with a registered ticker callback
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.inner.subscribers.lock().unwrap().keys().cloned().collect()
    }

    /// Registers callbacks and asks the upstream for ticker pushes
    ///
    /// One subscribe op is sent carrying one arg per symbol. When the link
    /// is down the callbacks are still recorded (reconnect replays them)
    /// but the call fails with `NotConnected` so the caller can report it.
    pub async fn subscribe_ticker(
        &self,
        symbols: &[String],
        callback: TickerCallback,
    ) -> Result<(), GatewayError> {
        if symbols.is_empty() {
            return Ok(());
        }
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            for symbol in symbols {
                subscribers.insert(symbol.clone(), Arc::clone(&callback));
            }
        }
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let args = symbols.iter().map(SubscriptionArg::ticker).collect();
        self.send_request(&WsRequest::subscribe(args)).await
    }

    /// Drops callbacks and tells the upstream to stop the pushes
    pub async fn unsubscribe(&self, symbols: &[String]) -> Result<(), GatewayError> {
        if symbols.is_empty() {
            return Ok(());
        }
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            for symbol in symbols {
                subscribers.remove(symbol);
            }
        }
        if !self.is_connected() {
            // Nothing to tell the upstream; the next replay omits them.
            return Ok(());
        }
        let args = symbols.iter().map(SubscriptionArg::ticker).collect();
        self.send_request(&WsRequest::unsubscribe(args)).await
    }

    /// Tears the client down; idempotent, the second call is a no-op
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.reconnect.lock().unwrap().enabled = false;
        self.inner.root_cancel.cancel();
        *self.inner.connected.write().unwrap() = false;
        *self.inner.outbound.lock().unwrap() = None;
        tracing::info!("upstream stream client closed");
    }

    /// Queues one request onto the writer with the queue deadline
    async fn send_request(&self, request: &WsRequest) -> Result<(), GatewayError> {
        let payload =
            serde_json::to_string(request).map_err(|e| GatewayError::Unknown(e.to_string()))?;
        let sender = {
            let outbound = self.inner.outbound.lock().unwrap();
            outbound.clone().ok_or(GatewayError::NotConnected)?
        };
        match timeout(WRITE_QUEUE_WAIT, sender.send(WsMessage::Text(payload.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::NotConnected),
            Err(_) => Err(GatewayError::WriteTimeout(WRITE_QUEUE_WAIT)),
        }
    }

    /// Establishes the transport and spawns reader, writer and watchdog
    async fn dial(&self) -> Result<(), GatewayError> {
        tracing::info!(url = %self.settings.url, "connecting to upstream stream");
        let stream = match connect_async(self.settings.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(primary_err) => match &self.settings.backup_url {
                Some(backup) => {
                    tracing::warn!(
                        error = %primary_err,
                        backup = %backup,
                        "primary stream URL failed, trying backup"
                    );
                    connect_async(backup.as_str())
                        .await
                        .map(|(stream, _)| stream)
                        .map_err(|e| GatewayError::Transient(format!("stream dial failed: {}", e)))?
                }
                None => {
                    return Err(GatewayError::Transient(format!(
                        "stream dial failed: {}",
                        primary_err
                    )))
                }
            },
        };

        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
        let conn_cancel = self.inner.root_cancel.child_token();

        *self.inner.outbound.lock().unwrap() = Some(tx);
        *self.inner.last_pong.write().unwrap() = Instant::now();
        *self.inner.connected.write().unwrap() = true;
        {
            let mut status = self.inner.status.lock().unwrap();
            status.last_connected_at = Some(Utc::now());
            status.next_attempt_at = None;
        }

        let reader = self.clone();
        let reader_cancel = conn_cancel.clone();
        tokio::spawn(async move { reader.reader_loop(source, reader_cancel).await });

        let writer = self.clone();
        let writer_cancel = conn_cancel.clone();
        tokio::spawn(async move { writer.writer_loop(sink, rx, writer_cancel).await });

        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.watchdog_loop(conn_cancel).await });

        tracing::info!("upstream stream connected");
        Ok(())
    }

    /// Reader: decode frames, dispatch callbacks, detect link loss
    async fn reader_loop(self, mut source: WsSource, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    *self.inner.last_pong.write().unwrap() = Instant::now();
                    self.handle_text(&text);
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    *self.inner.last_pong.write().unwrap() = Instant::now();
                    let sender = self.inner.outbound.lock().unwrap().clone();
                    if let Some(sender) = sender {
                        let _ = sender.try_send(WsMessage::Pong(data));
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    *self.inner.last_pong.write().unwrap() = Instant::now();
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(frame = ?frame, "upstream closed the stream");
                    break;
                }
                Some(Ok(_)) => {
                    tracing::debug!("ignoring non-text upstream frame");
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "upstream read error");
                    break;
                }
                None => {
                    tracing::info!("upstream stream ended");
                    break;
                }
            }
        }
        cancel.cancel();
        self.handle_disconnect();
    }

    /// Routes one decoded text frame
    fn handle_text(&self, text: &str) {
        match UpstreamFrame::parse(text) {
            UpstreamFrame::Event(event) => {
                if event.event == "error" {
                    tracing::warn!(
                        code = event.code.as_deref().unwrap_or(""),
                        msg = event.msg.as_deref().unwrap_or(""),
                        "upstream rejected a stream request"
                    );
                } else {
                    tracing::debug!(event = %event.event, arg = ?event.arg, "stream control reply");
                }
            }
            UpstreamFrame::Push(push) => {
                for ticker in push.data {
                    // Clone the callback out of the map so user code never
                    // runs under the subscribers lock.
                    let callback = {
                        let subscribers = self.inner.subscribers.lock().unwrap();
                        subscribers.get(&ticker.symbol).cloned()
                    };
                    match callback {
                        Some(callback) => callback(ticker),
                        None => {
                            tracing::debug!(symbol = %ticker.symbol, "ticker for unsubscribed symbol")
                        }
                    }
                }
            }
            UpstreamFrame::Unknown(raw) => {
                tracing::debug!(frame = %raw, "unknown upstream frame");
            }
        }
    }

    /// Writer: drain the outbound queue, ping on the interval
    async fn writer_loop(
        self,
        mut sink: WsSink,
        mut rx: mpsc::Receiver<WsMessage>,
        cancel: CancellationToken,
    ) {
        let mut ping_tick = tokio::time::interval(self.settings.ping_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_tick.tick().await; // first tick fires immediately, skip it

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = timeout(self.settings.write_wait, sink.send(WsMessage::Close(None))).await;
                    return;
                }
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
                _ = ping_tick.tick() => WsMessage::Ping(Vec::new().into()),
            };
            match timeout(self.settings.write_wait, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "upstream write failed, closing link");
                    cancel.cancel();
                    self.handle_disconnect();
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        write_wait_ms = self.settings.write_wait.as_millis() as u64,
                        "upstream write missed its deadline, closing link"
                    );
                    cancel.cancel();
                    self.handle_disconnect();
                    return;
                }
            }
        }
    }

    /// Watchdog: kill the link when pongs (or any inbound frames) stop
    async fn watchdog_loop(self, cancel: CancellationToken) {
        let tick = (self.settings.pong_timeout / 4).max(Duration::from_millis(50));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let idle = self.inner.last_pong.read().unwrap().elapsed();
            if idle > self.settings.pong_timeout {
                tracing::warn!(
                    idle_ms = idle.as_millis() as u64,
                    "upstream heartbeat timed out, closing link"
                );
                cancel.cancel();
                self.handle_disconnect();
                return;
            }
        }
    }

    /// Single funnel for link loss from any task
    ///
    /// The reader exit, a writer failure and the watchdog all arrive here;
    /// the `pending` flag under the reconnect mutex guarantees exactly one
    /// reconnect schedule per disconnect.
    fn handle_disconnect(&self) {
        *self.inner.connected.write().unwrap() = false;
        *self.inner.outbound.lock().unwrap() = None;
        self.inner.status.lock().unwrap().last_disconnected_at = Some(Utc::now());

        let schedule = {
            let mut guard = self.inner.reconnect.lock().unwrap();
            if guard.pending || !guard.enabled || self.inner.closed.load(Ordering::SeqCst) {
                false
            } else if guard.attempts >= self.settings.max_reconnect_attempts {
                tracing::warn!(
                    attempts = guard.attempts,
                    "upstream reconnect budget exhausted, staying disconnected"
                );
                false
            } else {
                guard.pending = true;
                true
            }
        };
        if schedule {
            let client = self.clone();
            tokio::spawn(async move { client.reconnect_loop().await });
        }
    }

    /// Walks the backoff schedule until the link is back or the budget
    /// runs out; on success replays the whole subscription set
    async fn reconnect_loop(self) {
        loop {
            let attempt = {
                let mut guard = self.inner.reconnect.lock().unwrap();
                if guard.attempts >= self.settings.max_reconnect_attempts {
                    guard.pending = false;
                    tracing::warn!(
                        attempts = guard.attempts,
                        "giving up on upstream reconnection"
                    );
                    return;
                }
                let attempt = guard.attempts;
                guard.attempts += 1;
                attempt
            };
            let delay = self.policy.delay(attempt);
            {
                let mut status = self.inner.status.lock().unwrap();
                status.attempts = attempt + 1;
                status.current_interval_ms = delay.as_millis() as u64;
                status.next_attempt_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            }
            tracing::info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling upstream reconnect"
            );

            tokio::select! {
                _ = self.inner.root_cancel.cancelled() => {
                    self.inner.reconnect.lock().unwrap().pending = false;
                    tracing::debug!("reconnect loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.inner.status.lock().unwrap().total_attempted += 1;
            match self.dial().await {
                Ok(()) => {
                    {
                        let mut guard = self.inner.reconnect.lock().unwrap();
                        guard.attempts = 0;
                        guard.pending = false;
                    }
                    {
                        let mut status = self.inner.status.lock().unwrap();
                        status.attempts = 0;
                        status.total_succeeded += 1;
                    }
                    if let Err(err) = self.replay_subscriptions().await {
                        tracing::warn!(error = %err, "subscription replay failed");
                    }
                    return;
                }
                Err(err) => {
                    self.inner.status.lock().unwrap().total_failed += 1;
                    tracing::warn!(error = %err, "upstream reconnect attempt failed");
                }
            }
        }
    }

    /// Reissues one subscribe op for the entire current map
    async fn replay_subscriptions(&self) -> Result<(), GatewayError> {
        // Atomic snapshot under the client lock.
        let symbols = self.subscribed_symbols();
        if symbols.is_empty() {
            return Ok(());
        }
        tracing::info!(count = symbols.len(), "replaying upstream subscriptions");
        let args = symbols.iter().map(SubscriptionArg::ticker).collect();
        self.send_request(&WsRequest::subscribe(args)).await
    }
}
