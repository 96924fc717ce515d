//! Length-prefixed framing over a byte stream
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+------------------+
//! |        Length (4B, big-endian)    |     Payload      |
//! +--------+--------+--------+--------+------------------+
//! ```

use super::{FrameReader, FrameWriter, TransportError, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads length-prefixed frames
pub struct StreamFrameReader<R> {
    inner: R,
}

impl<R> StreamFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for StreamFrameReader<R> {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        let len = self
            .inner
            .read_u32()
            .await
            .map_err(TransportError::from_io)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut buf = BytesMut::zeroed(len);
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(TransportError::from_io)?;
        Ok(buf.freeze())
    }
}

/// Writes length-prefixed frames
pub struct StreamFrameWriter<W> {
    inner: W,
}

impl<W> StreamFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamFrameWriter<W> {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.extend_from_slice(&frame);

        self.inner
            .write_all(&buf)
            .await
            .map_err(TransportError::from_io)?;
        self.inner.flush().await.map_err(TransportError::from_io)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedConn;

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = FramedConn::from_stream(a);
        let mut right = FramedConn::from_stream(b);

        let sender = tokio::spawn(async move {
            left.send(Bytes::from_static(b"one")).await.unwrap();
            left.send(Bytes::new()).await.unwrap();
            left.send(Bytes::from(vec![7u8; 1000])).await.unwrap();
            left
        });

        assert_eq!(&right.recv().await.unwrap()[..], b"one");
        assert!(right.recv().await.unwrap().is_empty());
        assert_eq!(right.recv().await.unwrap().len(), 1000);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_maps_to_closed() {
        let (a, b) = tokio::io::duplex(64);
        let mut right = FramedConn::from_stream(b);
        drop(a);
        assert!(right.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut left = FramedConn::from_stream(a);

        let err = left
            .send(Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));

        b.write_u32(MAX_FRAME_SIZE as u32 + 1).await.unwrap();
        let err = left.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }
}
