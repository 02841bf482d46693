//! # Gateway Events
//!
//! Everything the gateway observes is published on a broadcast channel.
//! Subscribers that fall behind lose the oldest events.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::codec::dispatch::DecodedPacket;
use crate::imei::Imei;
use crate::session::SessionId;

/// Default broadcast capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observable gateway event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Transport accepted a peer
    Connected { session_id: SessionId, peer: SocketAddr },

    /// First unit was not a valid IMEI
    HandshakeRejected { session_id: SessionId, peer: SocketAddr, reason: String },

    /// Device identified itself
    Authenticated { session_id: SessionId, imei: Imei, peer: SocketAddr },

    /// Decoded inbound unit
    Packet {
        imei: Imei,
        received_at: DateTime<Utc>,
        label: String,
        packet: DecodedPacket,
    },

    CommandSent { imei: Imei, command: String },

    CommandCompleted { imei: Imei, command: String, response: String },

    CommandFailed { imei: Imei, command: String, error: String },

    TransferProgress { imei: Imei, bytes_acked: usize, total: usize },

    TransferFinished { imei: Imei, success: bool, error: Option<String> },

    /// Session ended
    Disconnected { session_id: SessionId, imei: Option<Imei>, reason: String },
}

/// Broadcast sink for [`GatewayEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
