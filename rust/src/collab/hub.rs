use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::model::UserId;

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// What the hub holds for one live connection: the bounded outbound queue
/// the connection's writer drains, and the token that tears it down.
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: UserId,
    tx: mpsc::Sender<Message>,
    close: CancellationToken,
}

enum DeliveryFailure {
    /// Outbound queue full: the consumer stopped draining.
    Slow,
    Closed,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: impl Into<String>,
        user_id: UserId,
        tx: mpsc::Sender<Message>,
        close: CancellationToken,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            user_id,
            tx,
            close,
        }
    }

    fn try_deliver(&self, msg: Message) -> Result<(), DeliveryFailure> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryFailure::Slow),
            Err(TrySendError::Closed(_)) => Err(DeliveryFailure::Closed),
        }
    }

    /// Ask the connection task to shut down.
    pub fn close(&self) {
        self.close.cancel();
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HubMetrics {
    pub broadcasts: AtomicU64,
    pub delivered: AtomicU64,
    pub pruned: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubMetricsSnapshot {
    pub broadcasts: u64,
    pub delivered: u64,
    pub pruned: u64,
}

impl HubMetrics {
    pub fn snapshot(&self) -> HubMetricsSnapshot {
        HubMetricsSnapshot {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Room registry: room id -> live connections.
///
/// Rooms appear on first register and disappear when their last connection
/// leaves. All membership changes go through `register`, `unregister` and
/// `broadcast`; each one holds only the room's shard lock and never awaits,
/// so a slow consumer cannot stall a room.
#[derive(Default)]
pub struct Hub {
    rooms: DashMap<String, HashMap<String, ConnectionHandle>>,
    metrics: HubMetrics,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, room: &str, handle: ConnectionHandle) {
        debug!(room, conn_id = %handle.conn_id, user_id = %handle.user_id, "hub register");
        self.rooms
            .entry(room.to_owned())
            .or_default()
            .insert(handle.conn_id.clone(), handle);
    }

    /// Remove a connection. Returns false if it was already gone (pruned by
    /// a broadcast, or never registered); that is not an error.
    pub fn unregister(&self, room: &str, conn_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut conns) => conns.remove(conn_id).is_some(),
            None => return false,
        };
        self.rooms.remove_if(room, |_, conns| conns.is_empty());
        if removed {
            debug!(room, conn_id, "hub unregister");
        }
        removed
    }

    /// Deliver `payload` to every live connection in `room`.
    ///
    /// Delivery is a non-blocking enqueue. A connection whose queue is full
    /// or closed is closed and pruned in the same pass.
    pub fn broadcast(&self, room: &str, payload: &str) -> BroadcastReport {
        self.metrics.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut report = BroadcastReport::default();
        let msg = Message::text(payload);

        let now_empty = match self.rooms.get_mut(room) {
            Some(mut conns) => {
                conns.retain(|conn_id, handle| match handle.try_deliver(msg.clone()) {
                    Ok(()) => {
                        report.delivered += 1;
                        true
                    }
                    Err(failure) => {
                        let reason = match failure {
                            DeliveryFailure::Slow => "outbound queue full",
                            DeliveryFailure::Closed => "connection closed",
                        };
                        info!(room, conn_id = %conn_id, reason, "pruning dead connection");
                        handle.close();
                        report.pruned += 1;
                        false
                    }
                });
                conns.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, conns| conns.is_empty());
        }

        self.metrics
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        if report.pruned > 0 {
            self.metrics
                .pruned
                .fetch_add(report.pruned as u64, Ordering::Relaxed);
        }
        report
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|conns| conns.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|room| room.len()).sum()
    }

    pub fn metrics(&self) -> HubMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shutdown: close every connection and forget all rooms.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.rooms.retain(|_, conns| {
            for handle in conns.values() {
                handle.close();
                closed += 1;
            }
            false
        });
        if closed > 0 {
            info!(closed, "hub closed all connections");
        }
        closed
    }
}
