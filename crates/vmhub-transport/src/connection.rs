//! Per-connection outbound delivery.
//!
//! Each live WebSocket connection registers an unbounded outbound queue in
//! the shared [`ConnectionMap`]. Senders enqueue without blocking; the
//! connection's own task drains the queue onto the socket, so a slow client
//! never stalls the code pushing to it.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use vmhub_protocol::ServerMessage;

/// Outbound push path used by the hub to reach a specific client.
///
/// Delivery is fire-and-forget: the message is enqueued on the connection's
/// outbound queue if one exists and silently dropped otherwise. There is no
/// delivery confirmation.
pub trait ResponseSender: Send + Sync {
    fn send(&self, connection_id: &str, vm_id: &str, vm_data: String);
}

/// Connection id → outbound queue for every live connection.
#[derive(Default)]
pub struct ConnectionMap {
    senders: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the receiving end of its queue.
    pub(crate) fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection_id.to_string(), tx);
        rx
    }

    pub(crate) fn deregister(&self, connection_id: &str) {
        self.senders.remove(connection_id);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Enqueue raw text for one connection. Returns false if the connection
    /// is not (or no longer) registered.
    pub fn send_text(&self, connection_id: &str, text: String) -> bool {
        match self.senders.get(connection_id) {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }
}

impl ResponseSender for ConnectionMap {
    fn send(&self, connection_id: &str, vm_id: &str, vm_data: String) {
        let message = ServerMessage::response(vm_id, vm_data);
        if let Ok(text) = serde_json::to_string(&message) {
            if !self.send_text(connection_id, text) {
                debug!("No live connection {connection_id}, dropping push for {vm_id}");
            }
        }
    }
}
