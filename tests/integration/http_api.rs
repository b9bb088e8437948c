//! HTTP surface tests over a live listener
//!
//! Health, stats, the REST passthrough (validation and upstream decoding)
//! and the process-wide request limit.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ticker_gateway::gateway::Gateway;
use ticker_gateway::http::create_router;

use crate::common::{init_test_env, test_config, MockUpstream};

/// Binds the router on an ephemeral port and returns its base URL
async fn serve(gateway: Arc<Gateway>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(gateway);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

async fn start_http_stack(rest_url: Option<String>) -> (Arc<Gateway>, String, MockUpstream) {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let mut config = test_config(&upstream.url);
    if let Some(rest_url) = rest_url {
        config.upstream.rest_url = rest_url;
    }
    let gateway = Arc::new(Gateway::new(config));
    gateway.start().await.expect("gateway start");
    let _session = upstream.accept(Duration::from_secs(5)).await;
    let base = serve(gateway.clone()).await;
    (gateway, base, upstream)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (gateway, base, _upstream) = start_http_stack(None).await;

    let body = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stats_endpoint_reports_gateway_state() {
    let (gateway, base, _upstream) = start_http_stack(None).await;

    let stats: serde_json::Value = reqwest::get(format!("{}/api/v1/stats", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(stats["upstream_connected"], true);
    assert_eq!(stats["connections"], 0);
    assert_eq!(stats["index"]["symbols"], 0);
    assert_eq!(stats["broadcast"]["total_broadcasts"], 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_candles_validation_maps_to_400() {
    let (gateway, base, _upstream) = start_http_stack(None).await;

    let response = reqwest::get(format!(
        "{}/api/v1/candles?symbol=BTCUSDT&granularity=7m",
        base
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "fatal_input");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_candles_passthrough_decodes_upstream_rows() {
    init_test_env();
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/candles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": "00000",
            "msg": "success",
            "requestTime": 0,
            "data": [["1700000000000", "100", "110", "90", "105", "12.5", "1300"]],
        })))
        .mount(&rest)
        .await;

    let (gateway, base, _upstream) = start_http_stack(Some(rest.uri())).await;

    let body: serde_json::Value = reqwest::get(format!(
        "{}/api/v1/candles?symbol=BTCUSDT&granularity=1m&limit=10",
        base
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(body["candles"][0]["ts"], 1700000000000i64);
    assert_eq!(body["candles"][0]["open"], "100");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_rest_rate_limit_returns_429() {
    init_test_env();
    let mut upstream = MockUpstream::spawn().await;
    let mut config = test_config(&upstream.url);
    config.downstream.rest_rate_limit = 2;
    let gateway = Arc::new(Gateway::new(config));
    gateway.start().await.expect("gateway start");
    let _session = upstream.accept(Duration::from_secs(5)).await;
    let base = serve(gateway.clone()).await;

    // The quota covers two requests; the third bounces at the middleware.
    let first = reqwest::get(format!("{}/api/v1/stats", base)).await.unwrap();
    assert_eq!(first.status(), 200);
    let second = reqwest::get(format!("{}/api/v1/stats", base)).await.unwrap();
    assert_eq!(second.status(), 200);
    let third = reqwest::get(format!("{}/api/v1/stats", base)).await.unwrap();
    assert_eq!(third.status(), 429);

    // /health sits outside the limited subtree.
    let health = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(health.status(), 200);

    gateway.shutdown().await;
}
