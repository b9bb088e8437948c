//! End-to-end downstream scenarios
//!
//! A real axum listener, real WebSocket clients and a scripted loopback
//! upstream: subscribe fan-in, multi-client fan-out with counters, the
//! app-level ping, and heartbeat eviction of a silent client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ticker_gateway::gateway::Gateway;
use ticker_gateway::http::create_router;

use crate::common::{init_test_env, test_config, ticker_push_json, MockSession, MockUpstream};

const WAIT: Duration = Duration::from_secs(5);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<WsClient, Message>;
type ClientSource = SplitStream<WsClient>;

struct Stack {
    gateway: Arc<Gateway>,
    session: MockSession,
    ws_url: String,
    _upstream: MockUpstream,
}

/// Boots the whole gateway against a scripted upstream and binds a real
/// downstream listener on an ephemeral port
async fn start_stack() -> Stack {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let gateway = Arc::new(Gateway::new(test_config(&upstream.url)));
    gateway.start().await.expect("gateway start");
    let session = upstream.accept(WAIT).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(gateway.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Stack {
        gateway,
        session,
        ws_url: format!("ws://{}/ws", addr),
        _upstream: upstream,
    }
}

async fn connect_client(ws_url: &str) -> (ClientSink, ClientSource) {
    let (stream, _) = connect_async(ws_url).await.expect("downstream connect");
    stream.split()
}

async fn send_json(sink: &mut ClientSink, body: &str) {
    sink.send(Message::Text(body.to_string().into()))
        .await
        .expect("client send");
}

/// Reads frames until one parses as JSON with the wanted `type`
async fn expect_type(source: &mut ClientSource, wanted: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let frame = tokio::time::timeout_at(deadline, source.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a {} frame", wanted))
            .expect("stream ended")
            .expect("stream error");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == wanted {
                return value;
            }
        }
    }
}

/// Asserts no further text frame of the given type arrives in `window`
async fn expect_no_type(source: &mut ClientSource, unwanted: &str, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, source.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_ne!(value["type"], unwanted, "unexpected {} frame: {}", unwanted, text);
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => return,
        }
    }
}

#[tokio::test]
async fn test_single_subscriber_receives_exactly_one_ticker() {
    let mut stack = start_stack().await;
    let (mut sink, mut source) = connect_client(&stack.ws_url).await;

    send_json(&mut sink, r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).await;
    let ack = expect_type(&mut source, "subscribe_success").await;
    assert_eq!(ack["symbols"][0], "BTCUSDT");

    // The gateway forwards one subscribe op upstream.
    let frame = stack.session.expect_text(WAIT).await;
    assert!(frame.contains("\"subscribe\""));
    assert!(frame.contains("BTCUSDT"));

    stack.session.push(&ticker_push_json("BTCUSDT", "50000.0"));

    let push = expect_type(&mut source, "ticker").await;
    assert_eq!(push["symbol"], "BTCUSDT");
    assert_eq!(push["data"]["lastPr"], "50000.0");
    assert_eq!(push["data"]["bidPr"], "49999.0");
    assert_eq!(push["data"]["askPr"], "50001.0");
    assert_eq!(push["data"]["fundingRate"], "0.0001");
    assert_eq!(push["data"]["holdingAmount"], "10000");
    assert!(push["timestamp"].as_i64().unwrap() > 0);

    // Exactly one: no second ticker without a second upstream push.
    expect_no_type(&mut source, "ticker", Duration::from_millis(300)).await;

    stack.gateway.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_two_subscribers_counters() {
    let mut stack = start_stack().await;
    let (mut sink1, mut source1) = connect_client(&stack.ws_url).await;
    let (mut sink2, mut source2) = connect_client(&stack.ws_url).await;

    send_json(&mut sink1, r#"{"type":"subscribe","symbols":["ETHUSDT"]}"#).await;
    expect_type(&mut source1, "subscribe_success").await;
    send_json(&mut sink2, r#"{"type":"subscribe","symbols":["ETHUSDT"]}"#).await;
    expect_type(&mut source2, "subscribe_success").await;

    // Only the first subscription grows the upstream set.
    let frame = stack.session.expect_text(WAIT).await;
    assert!(frame.contains("ETHUSDT"));

    stack.session.push(&ticker_push_json("ETHUSDT", "3000.0"));

    let push1 = expect_type(&mut source1, "ticker").await;
    let push2 = expect_type(&mut source2, "ticker").await;
    assert_eq!(push1["symbol"], "ETHUSDT");
    assert_eq!(push2["symbol"], "ETHUSDT");
    expect_no_type(&mut source1, "ticker", Duration::from_millis(300)).await;
    expect_no_type(&mut source2, "ticker", Duration::from_millis(300)).await;

    // One broadcast, two successful deliveries (give the worker a beat
    // to finish its bookkeeping).
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = stack.gateway.broadcast.stats();
    assert_eq!(stats.total_broadcasts, 1);
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.failed, 0);

    stack.gateway.shutdown().await;
}

#[tokio::test]
async fn test_app_level_ping_pong_and_error_reply() {
    let stack = start_stack().await;
    let (mut sink, mut source) = connect_client(&stack.ws_url).await;

    send_json(&mut sink, r#"{"type":"ping"}"#).await;
    let pong = expect_type(&mut source, "pong").await;
    assert!(pong["timestamp"].as_i64().unwrap() > 0);

    // Lowercase symbols violate the wire contract.
    send_json(&mut sink, r#"{"type":"subscribe","symbols":["btcusdt"]}"#).await;
    let err = expect_type(&mut source, "error").await;
    assert_eq!(err["code"], "fatal_input");

    // Unparseable frames get a structured error too.
    send_json(&mut sink, "ticker please").await;
    let err = expect_type(&mut source, "error").await;
    assert_eq!(err["code"], "fatal_input");

    stack.gateway.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribed_symbol_not_delivered() {
    let mut stack = start_stack().await;
    let (mut sink, mut source) = connect_client(&stack.ws_url).await;

    send_json(&mut sink, r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).await;
    expect_type(&mut source, "subscribe_success").await;
    let _ = stack.session.expect_text(WAIT).await;

    // Nobody subscribed to SOLUSDT: the push dies on the fast path.
    stack.session.push(&ticker_push_json("SOLUSDT", "150.0"));
    stack.session.push(&ticker_push_json("BTCUSDT", "50000.0"));

    let push = expect_type(&mut source, "ticker").await;
    assert_eq!(push["symbol"], "BTCUSDT");
    expect_no_type(&mut source, "ticker", Duration::from_millis(300)).await;

    stack.gateway.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_unsubscribe_roundtrip_releases_upstream() {
    let mut stack = start_stack().await;
    let (mut sink, mut source) = connect_client(&stack.ws_url).await;

    send_json(&mut sink, r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).await;
    expect_type(&mut source, "subscribe_success").await;
    let frame = stack.session.expect_text(WAIT).await;
    assert!(frame.contains("\"subscribe\""));

    send_json(&mut sink, r#"{"type":"unsubscribe","symbols":["BTCUSDT"]}"#).await;
    expect_type(&mut source, "unsubscribe_success").await;
    let frame = stack.session.expect_text(WAIT).await;
    assert!(frame.contains("\"unsubscribe\""));

    // Index back to identity.
    let stats = stack.gateway.index.stats();
    assert_eq!(stats.symbols, 0);
    assert_eq!(stats.total_subscriptions, 0);

    stack.gateway.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_evicted_by_heartbeat() {
    let mut stack = start_stack().await;
    let (mut sink, mut source) = connect_client(&stack.ws_url).await;

    send_json(&mut sink, r#"{"type":"subscribe","symbols":["BTCUSDT"]}"#).await;
    expect_type(&mut source, "subscribe_success").await;
    let _ = stack.session.expect_text(WAIT).await;
    assert_eq!(stack.gateway.registry.count(), 1);

    // Keep the socket open but stop polling it: auto-pong only happens
    // on poll, so transport pongs stop while TCP stays up. The supervisor
    // must mark the connection stale and evict it (ping 100ms, pong wait
    // 400ms, one miss allowed).
    let _parked = (sink, source);

    tokio::time::timeout(WAIT, async {
        loop {
            if stack.gateway.registry.count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("silent client was never evicted");

    // Cleanup propagated to the index: broadcasts skip the ghost.
    tokio::time::timeout(WAIT, async {
        loop {
            if stack.gateway.index.subscribers("BTCUSDT").is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("index never dropped the ghost connection");

    stack.gateway.shutdown().await;
}
