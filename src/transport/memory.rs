//! In-memory framed connections

use super::{FrameReader, FrameWriter, FramedConn, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Two connected framed connections buffering up to `capacity` frames per direction
pub fn memory_pair(capacity: usize) -> (FramedConn, FramedConn) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));

    let a = FramedConn::new(MemoryReader { rx: b_rx }, MemoryWriter { tx: Some(a_tx) });
    let b = FramedConn::new(MemoryReader { rx: a_rx }, MemoryWriter { tx: Some(b_tx) });
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_both_directions() {
        let (mut a, mut b) = memory_pair(4);

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(&b.recv().await.unwrap()[..], b"ping");
        assert_eq!(&a.recv().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_close_ends_peer_reads() {
        let (mut a, mut b) = memory_pair(4);
        a.send(Bytes::from_static(b"last")).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(&b.recv().await.unwrap()[..], b"last");
        assert!(b.recv().await.unwrap_err().is_closed());
        assert!(a.send(Bytes::new()).await.unwrap_err().is_closed());
    }
}
