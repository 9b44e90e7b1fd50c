//! Message bus adapter — publish/subscribe transport plus the durable
//! key/value side-channel used for small persistent state.
//!
//! Delivery is at-least-once and ordered only within a single channel, so
//! every handler downstream must be idempotent. No replay of missed messages
//! is assumed; the reconciliation engine closes any gap.
//!
//! Two backends implement the same trait:
//!   `WsBus`     — JSON frames over a WebSocket to the bus server, with
//!                 reconnect + resubscribe (production).
//!   `MemoryBus` — in-process channels + HashMap KV (tests, single-node).

pub mod memory;
pub mod ws;

pub use memory::MemoryBus;
pub use ws::WsBus;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────

/// Channel names shared with the other services on the bus.
pub mod channels {
    // Consumed.
    pub const WEBHOOK_RECEIVED: &str = "WEBHOOK_RECEIVED";
    pub const TRADE_SIGNAL: &str = "TRADE_SIGNAL";
    pub const ORDER_PLACED: &str = "ORDER_PLACED";
    pub const ORDER_FILLED: &str = "ORDER_FILLED";
    pub const ORDER_REJECTED: &str = "ORDER_REJECTED";
    pub const ORDER_CANCELLED: &str = "ORDER_CANCELLED";
    pub const POSITION_UPDATE: &str = "POSITION_UPDATE";
    pub const POSITION_CLOSED: &str = "POSITION_CLOSED";
    pub const PRICE_UPDATE: &str = "PRICE_UPDATE";
    pub const ORDERS_SYNCED: &str = "ORDERS_SYNCED";
    pub const FULL_SYNC_STARTED: &str = "TRADOVATE_FULL_SYNC_STARTED";
    pub const SYNC_COMPLETED: &str = "TRADOVATE_SYNC_COMPLETED";

    // Produced.
    pub const TRADE_VALIDATED: &str = "TRADE_VALIDATED";
    pub const TRADE_REJECTED: &str = "TRADE_REJECTED";
    pub const ORDER_REQUEST: &str = "ORDER_REQUEST";
    pub const ORDER_CANCEL_REQUEST: &str = "ORDER_CANCEL_REQUEST";
    pub const POSITION_REALTIME_UPDATE: &str = "POSITION_REALTIME_UPDATE";
    pub const SYNC_REQUEST: &str = "SYNC_REQUEST";
    pub const SERVICE_STARTED: &str = "SERVICE_STARTED";
    pub const SERVICE_STOPPED: &str = "SERVICE_STOPPED";

    /// Everything the orchestrator listens on.
    pub const CONSUMED: [&str; 12] = [
        WEBHOOK_RECEIVED,
        TRADE_SIGNAL,
        ORDER_PLACED,
        ORDER_FILLED,
        ORDER_REJECTED,
        ORDER_CANCELLED,
        POSITION_UPDATE,
        POSITION_CLOSED,
        PRICE_UPDATE,
        ORDERS_SYNCED,
        FULL_SYNC_STARTED,
        SYNC_COMPLETED,
    ];
}

// ─────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BusError {
    /// Transport is down. Retryable; callers decide whether to requeue.
    #[error("bus disconnected")]
    Disconnected,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus request timed out")]
    Timeout,
    #[error("bus protocol error: {0}")]
    Protocol(String),
}

/// One delivered frame.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub data: Value,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to a channel. At-least-once; retryable on error.
    async fn publish(&self, channel: &str, data: Value) -> Result<(), BusError>;

    /// Subscribe to a set of channels; all matching frames arrive on the
    /// returned receiver. Subscriptions survive reconnects.
    async fn subscribe(&self, chans: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    /// Read a key from the durable side-channel. `None` means never written
    /// (or expired) — first boot must tolerate this.
    async fn get(&self, key: &str) -> Result<Option<Value>, BusError>;

    /// Whole-key replace with optional TTL.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}
