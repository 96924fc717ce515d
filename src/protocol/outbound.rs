//! Shared outbound queue
//!
//! Many producers (sessions, channels, pings) hand encoded link messages to
//! the single send task. Producers block while the queue is full. Once the
//! queue is closed every producer gets [`QueueClosed`] back instead of the
//! message silently vanishing or the task faulting.

use super::{LinkKind, LinkMessage};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Returned to producers that enqueue after the link has shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound queue is closed")]
pub struct QueueClosed;

/// Producer handle for the outbound queue
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

/// Consumer side of the outbound queue, owned by the send task
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl Outbound {
    /// Create a bounded queue
    pub fn channel(capacity: usize) -> (Outbound, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Outbound { tx }, OutboundReceiver { rx })
    }

    /// Enqueue a link message, waiting for capacity
    pub async fn send(&self, message: LinkMessage) -> Result<(), QueueClosed> {
        self.tx
            .send(message.encode())
            .await
            .map_err(|_| QueueClosed)
    }

    /// Enqueue a body tagged with `kind`
    pub async fn send_kind(&self, kind: LinkKind, body: Bytes) -> Result<(), QueueClosed> {
        self.send(LinkMessage::new(kind, body)).await
    }

    /// Check whether the consumer is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundReceiver {
    /// Dequeue the next encoded message
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Refuse further messages; already queued messages can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}
