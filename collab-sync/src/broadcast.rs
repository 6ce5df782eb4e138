//! Per-document fan-out to N-1 sessions with backpressure.
//!
//! Uses one tokio broadcast channel per document. Each session owns an
//! independent receiver cursor that buffers up to `capacity` frames; a session
//! that falls further behind than that is reported as lagged and disconnected
//! by its task.
//!
//! Frames are encoded once by the sender and shared as `Arc<Vec<u8>>`.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// One frame on a document channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Session that produced the fragment; never receives it back
    pub origin: Uuid,
    /// Encoded `ServerMessage`
    pub frame: Arc<Vec<u8>>,
}

/// Broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
}

impl BroadcastGroup {
    /// Create a group buffering `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Hand session `session_id` a receiver.
    ///
    /// The receiver only sees frames sent after this call. Dropping it
    /// leaves the group.
    pub fn subscribe(&self, session_id: Uuid) -> PeerReceiver {
        PeerReceiver {
            session_id,
            rx: self.sender.subscribe(),
        }
    }

    /// Send a pre-encoded frame to every receiver. Lock-free.
    ///
    /// Returns the number of receivers; 0 when nobody listens.
    pub fn broadcast_raw(&self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        self.sender.send(Outbound { origin, frame }).unwrap_or(0)
    }
}

/// Why a receiver stopped yielding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStop {
    /// Missed this many frames; the session must resync or disconnect
    Lagged(u64),
    /// The group was dropped
    Closed,
}

/// A session's cursor into its document channel.
pub struct PeerReceiver {
    session_id: Uuid,
    rx: broadcast::Receiver<Outbound>,
}

impl PeerReceiver {
    /// Next frame not produced by this session, in send order.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvStop> {
        loop {
            match self.rx.recv().await {
                Ok(out) if out.origin == self.session_id => continue,
                Ok(out) => return Ok(out.frame),
                Err(RecvError::Lagged(n)) => return Err(RecvStop::Lagged(n)),
                Err(RecvError::Closed) => return Err(RecvStop::Closed),
            }
        }
    }
}
