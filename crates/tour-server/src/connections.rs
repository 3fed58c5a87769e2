//! Live WebSocket connections and their outbound queues.
//!
//! Every connection gets a numeric id and a bounded channel drained by its
//! writer task. Sessions address connections by id only, so a connection
//! going away never leaves a dangling socket reference behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tour_core::ServerMessage;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Identifier of one accepted WebSocket connection.
pub type ConnectionId = u64;

/// Outbound envelopes buffered per connection.
pub const OUTBOUND_CAPACITY: usize = 256;

pub struct ConnectionRegistry {
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a connection; the receiver feeds its writer task.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.senders.write().await.insert(id, tx);
        debug!(conn_id = id, "connection registered");
        (id, rx)
    }

    /// Remove a connection. Its writer drains what is queued, then stops.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.senders.write().await.remove(&id).is_some();
        if removed {
            debug!(conn_id = id, "connection unregistered");
        }
        removed
    }

    /// Queue one envelope for `id`. Returns `false` when the connection is
    /// gone; the envelope is dropped.
    pub async fn send(&self, id: ConnectionId, msg: impl Into<ServerMessage>) -> bool {
        let tx = self.senders.read().await.get(&id).cloned();
        match tx {
            Some(tx) => {
                let delivered = tx.send(msg.into()).await.is_ok();
                if !delivered {
                    trace!(conn_id = id, "send to closed connection dropped");
                }
                delivered
            }
            None => {
                trace!(conn_id = id, "send to unknown connection dropped");
                false
            }
        }
    }

    /// Queue one envelope for `id` without waiting. A full queue drops the
    /// envelope, so a stalled socket never holds up the caller.
    pub async fn try_send(&self, id: ConnectionId, msg: impl Into<ServerMessage>) -> bool {
        let tx = self.senders.read().await.get(&id).cloned();
        let Some(tx) = tx else {
            trace!(conn_id = id, "send to unknown connection dropped");
            return false;
        };
        match tx.try_send(msg.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(conn_id = id, "outbound queue full, envelope dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!(conn_id = id, "send to closed connection dropped");
                false
            }
        }
    }

    /// Best-effort fan-out. Full or closed queues skip the envelope.
    /// Returns how many connections accepted it.
    pub async fn broadcast(&self, msg: ServerMessage) -> usize {
        let senders = self.senders.read().await;
        let mut delivered = 0;
        for (id, tx) in senders.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(conn_id = id, error = %e, "broadcast skipped"),
            }
        }
        delivered
    }

    pub async fn count(&self) -> usize {
        self.senders.read().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.senders.read().await.contains_key(&id)
    }
}
