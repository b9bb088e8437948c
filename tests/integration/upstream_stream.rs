//! Streaming client tests against loopback WebSocket servers
//!
//! Exercises the dial/subscribe path, ticker fan-in, reconnect with
//! subscription replay, and the heartbeat watchdog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use ticker_gateway::bitget::stream::{StreamSettings, UpstreamStreamClient};
use ticker_gateway::bitget::TickerData;
use ticker_gateway::hub::reconnect::{BackoffPolicy, BackoffStrategy};

use crate::common::{init_test_env, ticker_push_json, MockUpstream};

const WAIT: Duration = Duration::from_secs(5);

fn fast_client(url: &str, pong_timeout: Duration) -> UpstreamStreamClient {
    let settings = StreamSettings {
        url: url.to_string(),
        backup_url: None,
        ping_interval: Duration::from_millis(100),
        pong_timeout,
        write_wait: Duration::from_millis(500),
        max_reconnect_attempts: 20,
    };
    let policy = BackoffPolicy {
        strategy: BackoffStrategy::Fixed,
        base: Duration::from_millis(50),
        max: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: false,
    };
    UpstreamStreamClient::with_policy(settings, policy)
}

fn ticker_channel() -> (
    Arc<dyn Fn(TickerData) + Send + Sync>,
    mpsc::UnboundedReceiver<TickerData>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(move |ticker| {
            let _ = tx.send(ticker);
        }),
        rx,
    )
}

/// Symbols named by the args of a subscribe/unsubscribe op
fn op_symbols(frame: &str) -> (String, Vec<String>) {
    let value: serde_json::Value = serde_json::from_str(frame).expect("frame must be JSON");
    let op = value["op"].as_str().unwrap_or_default().to_string();
    let mut symbols: Vec<String> = value["args"]
        .as_array()
        .expect("args must be an array")
        .iter()
        .map(|arg| arg["instId"].as_str().unwrap_or_default().to_string())
        .collect();
    symbols.sort();
    (op, symbols)
}

#[tokio::test]
async fn test_subscribe_sends_one_op_per_call() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let client = fast_client(&upstream.url, Duration::from_secs(5));

    client.connect().await.unwrap();
    let mut session = upstream.accept(WAIT).await;
    assert!(client.is_connected());

    let (callback, _rx) = ticker_channel();
    client
        .subscribe_ticker(&["BTCUSDT".to_string(), "ETHUSDT".to_string()], callback)
        .await
        .unwrap();

    let frame = session.expect_text(WAIT).await;
    let (op, symbols) = op_symbols(&frame);
    assert_eq!(op, "subscribe");
    assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

    // Wire shape: one arg per symbol with the futures product type.
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["args"].as_array().unwrap().len(), 2);
    assert_eq!(value["args"][0]["instType"], "USDT-FUTURES");
    assert_eq!(value["args"][0]["channel"], "ticker");

    client.close().await;
}

#[tokio::test]
async fn test_ticker_fan_in_reaches_callback() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let client = fast_client(&upstream.url, Duration::from_secs(5));

    client.connect().await.unwrap();
    let mut session = upstream.accept(WAIT).await;

    let (callback, mut ticks) = ticker_channel();
    client
        .subscribe_ticker(&["BTCUSDT".to_string()], callback)
        .await
        .unwrap();
    let _ = session.expect_text(WAIT).await;

    session.push(&ticker_push_json("BTCUSDT", "50000.0"));

    let ticker = tokio::time::timeout(WAIT, ticks.recv())
        .await
        .expect("no ticker arrived")
        .unwrap();
    assert_eq!(ticker.symbol, "BTCUSDT");
    assert_eq!(ticker.last_pr, "50000.0");
    assert_eq!(ticker.funding_rate, "0.0001");

    client.close().await;
}

#[tokio::test]
async fn test_unknown_frames_are_skipped() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let client = fast_client(&upstream.url, Duration::from_secs(5));

    client.connect().await.unwrap();
    let mut session = upstream.accept(WAIT).await;

    let (callback, mut ticks) = ticker_channel();
    client
        .subscribe_ticker(&["BTCUSDT".to_string()], callback)
        .await
        .unwrap();
    let _ = session.expect_text(WAIT).await;

    session.push("not json at all");
    session.push(r#"{"event":"subscribe","code":"0","msg":""}"#);
    session.push(&ticker_push_json("BTCUSDT", "51000.0"));

    // Only the ticker push reaches the callback.
    let ticker = tokio::time::timeout(WAIT, ticks.recv()).await.unwrap().unwrap();
    assert_eq!(ticker.last_pr, "51000.0");
    assert!(ticks.try_recv().is_err());

    client.close().await;
}

#[tokio::test]
async fn test_reconnect_replays_whole_subscription_set() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let client = fast_client(&upstream.url, Duration::from_secs(5));

    client.connect().await.unwrap();
    let mut session = upstream.accept(WAIT).await;

    let (callback, mut ticks) = ticker_channel();
    client
        .subscribe_ticker(&["BTCUSDT".to_string()], callback.clone())
        .await
        .unwrap();
    client
        .subscribe_ticker(&["ETHUSDT".to_string()], callback)
        .await
        .unwrap();
    let _ = session.expect_text(WAIT).await;
    let _ = session.expect_text(WAIT).await;

    // Kill the transport; the client must come back on its own.
    session.kill();
    let mut session = upstream.accept(WAIT).await;

    // First frame after reconnect: a single subscribe op carrying the
    // whole accumulated set, order unspecified.
    let frame = session.expect_text(WAIT).await;
    let (op, symbols) = op_symbols(&frame);
    assert_eq!(op, "subscribe");
    assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

    // The replayed link carries data again.
    session.push(&ticker_push_json("ETHUSDT", "3000.0"));
    let ticker = tokio::time::timeout(WAIT, ticks.recv()).await.unwrap().unwrap();
    assert_eq!(ticker.symbol, "ETHUSDT");

    // Reconnect bookkeeping converged.
    let status = client.reconnect_status();
    assert_eq!(status.attempts, 0);
    assert!(status.total_succeeded >= 1);

    client.close().await;
}

#[tokio::test]
async fn test_watchdog_recycles_a_silent_link() {
    init_test_env();
    let mut upstream = MockUpstream::spawn_silent().await;
    let client = fast_client(&upstream.url, Duration::from_millis(400));

    client.connect().await.unwrap();
    let _session = upstream.accept(WAIT).await;

    // The server never answers pings and pushes nothing, so the watchdog
    // must recycle the link and the client must dial again.
    let _second = upstream.accept(WAIT).await;
    let status = client.reconnect_status();
    assert!(status.last_disconnected_at.is_some());

    client.close().await;
}

#[tokio::test]
async fn test_unsubscribe_sends_op_and_shrinks_replay_set() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let client = fast_client(&upstream.url, Duration::from_secs(5));

    client.connect().await.unwrap();
    let mut session = upstream.accept(WAIT).await;

    let (callback, _ticks) = ticker_channel();
    client
        .subscribe_ticker(&["BTCUSDT".to_string(), "ETHUSDT".to_string()], callback)
        .await
        .unwrap();
    let _ = session.expect_text(WAIT).await;

    client.unsubscribe(&["ETHUSDT".to_string()]).await.unwrap();
    let frame = session.expect_text(WAIT).await;
    let (op, symbols) = op_symbols(&frame);
    assert_eq!(op, "unsubscribe");
    assert_eq!(symbols, vec!["ETHUSDT".to_string()]);

    // Replay after a kill only carries the remaining symbol.
    session.kill();
    let mut session = upstream.accept(WAIT).await;
    let frame = session.expect_text(WAIT).await;
    let (op, symbols) = op_symbols(&frame);
    assert_eq!(op, "subscribe");
    assert_eq!(symbols, vec!["BTCUSDT".to_string()]);

    client.close().await;
}
