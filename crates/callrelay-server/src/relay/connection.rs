//! Per-connection send handle.
//!
//! A `ClientConnection` owns no routing state. Frames handed to it are
//! queued on a bounded channel that exactly one writer task drains into the
//! socket, so concurrent senders never interleave frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::identity::ConnectionId;

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of frames dropped due to a full or closed queue.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection around the writer task's channel.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection with a fresh id and its outbound queue.
    pub fn open(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(ConnectionId::new(), tx)), rx)
    }

    /// Queue a serialized frame for the client.
    ///
    /// Never waits. Returns `false` if the queue is full or the writer has
    /// gone away, and increments the dropped frame counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
