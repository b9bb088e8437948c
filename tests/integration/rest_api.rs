//! Upstream REST client tests against a mocked exchange API
//!
//! Covers envelope decoding, the business-code table, candle validation
//! (including the no-network fast-fail), limit clamping and the token
//! bucket's request pacing.

use std::time::{Duration, Instant};

use rstest::rstest;
use serde_json::json;
use wiremock::matchers::{any, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ticker_gateway::bitget::rate_limit::UpstreamRateLimiter;
use ticker_gateway::bitget::BitgetRestClient;
use ticker_gateway::error::ErrorKind;

use crate::common::init_test_env;

fn client_for(server: &MockServer) -> BitgetRestClient {
    BitgetRestClient::new(
        server.uri(),
        None,
        Duration::from_secs(2),
        UpstreamRateLimiter::new(1_000, 100),
    )
}

fn envelope(data: serde_json::Value) -> serde_json::Value {
    json!({
        "code": "00000",
        "msg": "success",
        "requestTime": 1700000000000i64,
        "data": data,
    })
}

#[tokio::test]
async fn test_list_contracts_decodes_catalog() {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/contracts"))
        .and(query_param("productType", "USDT-FUTURES"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            {"symbol": "BTCUSDT", "baseCoin": "BTC", "quoteCoin": "USDT", "symbolStatus": "normal"},
            {"symbol": "ETHUSDT", "baseCoin": "ETH", "quoteCoin": "USDT", "symbolStatus": "normal"}
        ]))))
        .expect(1)
        .mount(&server)
        .await;

    let contracts = client_for(&server).list_contracts().await.unwrap();
    assert_eq!(contracts.len(), 2);
    assert_eq!(contracts[0].symbol, "BTCUSDT");
    assert_eq!(contracts[0].base_coin, "BTC");
    assert_eq!(contracts[1].symbol, "ETHUSDT");
}

#[tokio::test]
async fn test_get_ticker_returns_first_row() {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/ticker"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            {"symbol": "BTCUSDT", "lastPr": "50000.0", "bidPr": "49999.0", "askPr": "50001.0", "ts": "1700000000000"}
        ]))))
        .mount(&server)
        .await;

    let ticker = client_for(&server).get_ticker("BTCUSDT").await.unwrap();
    assert_eq!(ticker.symbol, "BTCUSDT");
    assert_eq!(ticker.last_pr, "50000.0");
}

#[tokio::test]
async fn test_get_candles_decodes_rows() {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/candles"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("granularity", "1m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            ["1700000000000", "100", "110", "90", "105", "12.5", "1300"],
            ["1700000060000", "105", "112", "101", "previous", "3.2", "340"]
        ]))))
        .mount(&server)
        .await;

    let candles = client_for(&server)
        .get_candles("BTCUSDT", "1m", None, None)
        .await
        .unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].ts, 1700000000000);
    assert_eq!(candles[0].open, "100");
    assert_eq!(candles[1].close, "previous");
}

#[tokio::test]
async fn test_candles_limit_clamped_to_200() {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/candles"))
        .and(query_param("limit", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([]))))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .get_candles("BTCUSDT", "1m", None, Some(5_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_granularity_issues_no_request() {
    init_test_env();
    let server = MockServer::start().await;

    // Any request reaching the server fails the test.
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([]))))
        .expect(0)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .get_candles("BTCUSDT", "7m", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FatalInput);
}

#[rstest]
#[case("40001", ErrorKind::FatalInput, false)]
#[case("40003", ErrorKind::FatalAuth, false)]
#[case("40005", ErrorKind::FatalAuth, false)]
#[case("40008", ErrorKind::FatalInput, false)]
#[case("50000", ErrorKind::Transient, true)]
#[case("50001", ErrorKind::RateLimited, true)]
#[case("50002", ErrorKind::Maintenance, true)]
#[case("77777", ErrorKind::Unknown, false)]
#[tokio::test]
async fn test_business_code_mapping(
    #[case] code: &str,
    #[case] expected: ErrorKind,
    #[case] retryable: bool,
) {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/contracts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": code,
            "msg": "upstream says no",
            "requestTime": 0,
            "data": null,
        })))
        .mount(&server)
        .await;

    let err = client_for(&server).list_contracts().await.unwrap_err();
    assert_eq!(err.kind(), expected);
    assert_eq!(err.is_retryable(), retryable);
}

#[rstest]
#[case(429, ErrorKind::RateLimited)]
#[case(500, ErrorKind::Transient)]
#[case(503, ErrorKind::Transient)]
#[case(403, ErrorKind::FatalAuth)]
#[tokio::test]
async fn test_transport_status_mapping(#[case] status: u16, #[case] expected: ErrorKind) {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/contracts"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;

    let err = client_for(&server).list_contracts().await.unwrap_err();
    assert_eq!(err.kind(), expected);
}

#[tokio::test]
async fn test_token_bucket_paces_requests() {
    init_test_env();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/contracts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([]))))
        .mount(&server)
        .await;

    // 50 tokens/s, burst 1: five sequential calls need four refills, so
    // at least ~80ms must elapse. The bound is left loose for CI noise.
    let client = BitgetRestClient::new(
        server.uri(),
        None,
        Duration::from_secs(2),
        UpstreamRateLimiter::new(50, 1),
    );
    let started = Instant::now();
    for _ in 0..5 {
        client.list_contracts().await.unwrap();
    }
    assert!(
        started.elapsed() >= Duration::from_millis(60),
        "five calls finished in {:?}, bucket is not pacing",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_backup_url_used_after_primary_failure() {
    init_test_env();
    let backup = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/mix/market/contracts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            {"symbol": "BTCUSDT"}
        ]))))
        .expect(1)
        .mount(&backup)
        .await;

    // Primary points at a closed port; the client falls back once.
    let client = BitgetRestClient::new(
        "http://127.0.0.1:9",
        Some(backup.uri()),
        Duration::from_millis(500),
        UpstreamRateLimiter::new(1_000, 100),
    );
    let contracts = client.list_contracts().await.unwrap();
    assert_eq!(contracts[0].symbol, "BTCUSDT");
}
