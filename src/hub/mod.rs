//! Downstream Streaming Hub
//!
//! Everything between the upstream stream client and the downstream
//! WebSocket handler: connection registry, subscription index, broadcast
//! engine, heartbeat supervisor, reconnect controller and the downstream
//! wire protocol.

pub mod broadcast;
pub mod heartbeat;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod subscriptions;

pub use broadcast::{BroadcastEngine, BroadcastStats};
pub use heartbeat::{HeartbeatConfig, HeartbeatStats, HeartbeatSupervisor};
pub use reconnect::{BackoffStrategy, ReconnectController, ReconnectStatus};
pub use registry::ConnectionRegistry;
pub use subscriptions::{IndexStats, SubscriptionIndex};
