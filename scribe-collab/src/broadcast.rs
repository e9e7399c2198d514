//! Fan-out of authority messages to every connection in a session.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each
//! of which buffers up to `capacity` messages. A subscriber that falls
//! further behind observes `Lagged` and has to resynchronise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use scribe_core::ClientId;

use crate::protocol::ServerMessage;

/// A message queued for every subscriber, optionally minus one.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that must not receive this message (usually its origin).
    pub exclude: Option<ClientId>,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn is_for(&self, client_id: ClientId) -> bool {
        self.exclude != Some(client_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages skipped by lagging subscribers.
    pub messages_dropped: u64,
    pub active_receivers: usize,
}

/// Lock-free counters on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-subscriber buffer before lagging starts.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.sender.subscribe()
    }

    /// Queue `message` for every subscriber except `exclude`.
    ///
    /// Returns the number of receivers the message reached. Never blocks,
    /// so it is safe to call while holding the session lock; that keeps
    /// updates in revision order on every receiver.
    pub fn broadcast(&self, message: ServerMessage, exclude: Option<ClientId>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Outbound { exclude, message }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
