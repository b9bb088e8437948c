//! Integration tests for the ticker gateway
//!
//! End-to-end coverage of the streaming plane: the upstream REST client
//! against a mocked exchange API, the stream client against loopback
//! WebSocket servers, and full downstream scenarios through a real axum
//! listener.

mod http_api;
mod rest_api;
mod upstream_stream;
mod ws_gateway;
