//! Connection Registry
//!
//! Owns the lifecycle of downstream connections: id generation, per
//! connection outbound queues, activity flags, and targeted delivery. The
//! WebSocket handler registers the write half here; everything else in the
//! gateway addresses connections by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::GatewayError;

/// Close code sent when the gateway drops a connection (policy violation
/// per RFC 6455)
const CLOSE_CODE_POLICY: u16 = 1008;

/// Outbound queue depth per connection
const OUTBOX_CAPACITY: usize = 64;

/// Tracked state for one downstream connection
struct DownstreamConnection {
    outbox: mpsc::Sender<Message>,
    created_at: Instant,
    last_pong: Instant,
    active: bool,
}

/// Point-in-time view of a connection for the stats surface
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub age: std::time::Duration,
    pub since_last_pong: std::time::Duration,
    pub active: bool,
}

/// Downstream connection registry
///
/// All mutation happens under one reader-writer lock held for the duration
/// of a single operation; the awaited outbound send runs outside it.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<String, DownstreamConnection>>,
    next_id: AtomicU64,
    max_connections: usize,
    write_wait: std::time::Duration,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, write_wait: std::time::Duration) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
            write_wait,
        }
    }

    /// Registers a new connection and returns its id
    ///
    /// Ids are monotonically unique within the process. Fails with
    /// `QueueFull` when the connection cap is reached; the caller closes
    /// the socket with an error frame.
    pub fn register(&self, outbox: mpsc::Sender<Message>) -> Result<String, GatewayError> {
        let mut conns = self.conns.write().unwrap();
        if conns.len() >= self.max_connections {
            return Err(GatewayError::QueueFull);
        }
        let id = format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        conns.insert(
            id.clone(),
            DownstreamConnection {
                outbox,
                created_at: now,
                last_pong: now,
                active: true,
            },
        );
        tracing::debug!(conn_id = %id, total = conns.len(), "registered downstream connection");
        Ok(id)
    }

    /// Delivers one frame to a named connection
    ///
    /// Fails with `NotFound` for unknown ids, `Inactive` when the
    /// connection is flagged off, and `WriteTimeout` when the bounded
    /// outbox does not accept the frame within the write deadline.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> Result<(), GatewayError> {
        let outbox = {
            let conns = self.conns.read().unwrap();
            let conn = conns
                .get(conn_id)
                .ok_or_else(|| GatewayError::NotFound(conn_id.to_string()))?;
            if !conn.active {
                return Err(GatewayError::Inactive(conn_id.to_string()));
            }
            conn.outbox.clone()
        };

        match timeout(self.write_wait, outbox.send(message)).await {
            Ok(Ok(())) => Ok(()),
            // Receiver dropped: the socket task is gone.
            Ok(Err(_)) => Err(GatewayError::NotFound(conn_id.to_string())),
            Err(_) => Err(GatewayError::WriteTimeout(self.write_wait)),
        }
    }

    /// True when the id is registered and active
    pub fn is_active(&self, conn_id: &str) -> bool {
        let conns = self.conns.read().unwrap();
        conns.get(conn_id).map(|c| c.active).unwrap_or(false)
    }

    /// Ids of all registered connections
    pub fn list(&self) -> Vec<String> {
        let conns = self.conns.read().unwrap();
        conns.keys().cloned().collect()
    }

    /// Number of registered connections
    pub fn count(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    /// Flags a connection inactive; broadcasts skip it from now on
    pub fn mark_inactive(&self, conn_id: &str) {
        let mut conns = self.conns.write().unwrap();
        if let Some(conn) = conns.get_mut(conn_id) {
            conn.active = false;
            tracing::debug!(conn_id = %conn_id, "marked connection inactive");
        }
    }

    /// Records a pong from the transport layer
    pub fn record_pong(&self, conn_id: &str) {
        let mut conns = self.conns.write().unwrap();
        if let Some(conn) = conns.get_mut(conn_id) {
            conn.last_pong = Instant::now();
        }
    }

    /// Removes a connection, optionally sending a close frame with a reason
    ///
    /// Dropping the outbox sender ends the socket's send task, which closes
    /// the transport.
    pub fn close(&self, conn_id: &str, reason: Option<&str>) {
        let removed = {
            let mut conns = self.conns.write().unwrap();
            conns.remove(conn_id)
        };
        let Some(conn) = removed else { return };
        if let Some(reason) = reason {
            let frame = Message::Close(Some(CloseFrame {
                code: CLOSE_CODE_POLICY,
                reason: reason.to_string().into(),
            }));
            // Best effort: the peer may already be gone.
            let _ = conn.outbox.try_send(frame);
        }
        tracing::debug!(conn_id = %conn_id, reason = ?reason, "closed downstream connection");
    }

    /// Removes every connection (shutdown path)
    pub fn close_all(&self) {
        let ids = self.list();
        for id in &ids {
            self.close(id, Some("gateway shutting down"));
        }
        tracing::info!(count = ids.len(), "closed all downstream connections");
    }

    /// Snapshot of one connection's bookkeeping
    pub fn connection_info(&self, conn_id: &str) -> Option<ConnectionInfo> {
        let conns = self.conns.read().unwrap();
        conns.get(conn_id).map(|conn| ConnectionInfo {
            id: conn_id.to_string(),
            age: conn.created_at.elapsed(),
            since_last_pong: conn.last_pong.elapsed(),
            active: conn.active,
        })
    }

    /// Default outbox capacity for new connections
    pub fn outbox_channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(OUTBOX_CAPACITY)
    }
}
