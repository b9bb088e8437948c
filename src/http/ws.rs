//! Downstream WebSocket Handler
//!
//! Upgrades `/ws` connections and runs the per-connection task pair: one
//! task drains the registry outbox into the socket, the other parses
//! client requests (subscribe/unsubscribe/ping) and feeds transport pongs
//! to the heartbeat supervisor. Everything else - fan-out, liveness,
//! cleanup - happens in the hub keyed by connection id.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::error::{ErrorKind, GatewayError};
use crate::gateway::Gateway;
use crate::http::AppState;
use crate::hub::protocol::{ClientMessage, ServerMessage};
use crate::hub::registry::ConnectionRegistry;

/// WebSocket upgrade handler for the downstream streaming protocol
///
/// ## Endpoint
/// `GET /ws`
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let read_limit = state.gateway.config().downstream.read_limit;
    ws.max_message_size(read_limit)
        .on_upgrade(move |socket| handle_socket(socket, state.gateway))
}

/// Runs one downstream connection from accept to cleanup
async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (outbox_tx, mut outbox_rx) = ConnectionRegistry::outbox_channel();
    let conn_id = match gateway.registry.register(outbox_tx) {
        Ok(conn_id) => conn_id,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting downstream connection");
            let mut socket = socket;
            let reply = ServerMessage::error(err.kind(), "connection limit reached").to_json();
            let _ = socket.send(Message::Text(reply.into())).await;
            let _ = socket.close().await;
            return;
        }
    };
    gateway.on_connect(&conn_id);

    let (mut sender, mut receiver) = socket.split();

    // Outbox drain: registry sends (broadcasts, acks, pings) -> socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if sender.send(frame).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Inbound loop: client requests and transport pongs.
    let recv_gateway = gateway.clone();
    let recv_conn_id = conn_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Text(text) => {
                    recv_gateway.index.touch(&recv_conn_id);
                    handle_client_text(&recv_gateway, &recv_conn_id, text.as_str()).await;
                }
                Message::Pong(_) => {
                    recv_gateway.heartbeat.record_pong(&recv_conn_id);
                }
                Message::Ping(_) => {
                    // axum answers transport pings automatically.
                }
                Message::Close(_) => {
                    tracing::debug!(conn_id = %recv_conn_id, "client sent close frame");
                    break;
                }
                Message::Binary(_) => {
                    let reply = ServerMessage::error(
                        ErrorKind::FatalInput,
                        "binary frames are not part of this protocol",
                    );
                    let _ = recv_gateway
                        .registry
                        .send_to(&recv_conn_id, Message::Text(reply.to_json().into()))
                        .await;
                }
            }
        }
    });

    // Whichever side finishes first tears the other down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.on_disconnect(&conn_id).await;
}

/// Parses and answers one client text frame
async fn handle_client_text(gateway: &Arc<Gateway>, conn_id: &str, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { symbols, .. }) => {
            match gateway.handle_subscribe(conn_id, &symbols).await {
                Ok(()) => ServerMessage::subscribe_success(symbols),
                Err(err) => error_reply(&err),
            }
        }
        Ok(ClientMessage::Unsubscribe { symbols, .. }) => {
            match gateway.handle_unsubscribe(conn_id, &symbols).await {
                Ok(()) => ServerMessage::unsubscribe_success(symbols),
                Err(err) => error_reply(&err),
            }
        }
        Ok(ClientMessage::Ping { .. }) => ServerMessage::pong(),
        Err(err) => {
            tracing::debug!(conn_id = %conn_id, error = %err, "unparseable client frame");
            ServerMessage::error(ErrorKind::FatalInput, "unrecognized message")
        }
    };

    if let Err(err) = gateway
        .registry
        .send_to(conn_id, Message::Text(reply.to_json().into()))
        .await
    {
        tracing::debug!(conn_id = %conn_id, error = %err, "failed to deliver reply");
    }
}

fn error_reply(err: &GatewayError) -> ServerMessage {
    ServerMessage::error(err.kind(), err.to_string())
}
