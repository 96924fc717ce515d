//! Enciphered framing
//!
//! Each frame payload is sealed on its own. Nonces are implicit per-direction
//! counters, so a dropped, replayed or reordered frame fails authentication.

use super::{FrameReader, FrameWriter, TransportError, MAX_FRAME_SIZE};
use crate::crypto::{Cipher, KEY_LEN, TAG_LEN};
use async_trait::async_trait;
use bytes::Bytes;

/// Opens frames received from an inner reader
pub struct SecureFrameReader<R> {
    inner: R,
    cipher: Cipher,
}

impl<R: FrameReader> SecureFrameReader<R> {
    pub fn new(inner: R, key: &[u8; KEY_LEN]) -> Result<Self, TransportError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
        })
    }
}

#[async_trait]
impl<R: FrameReader> FrameReader for SecureFrameReader<R> {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        let sealed = self.inner.recv().await?;
        let plain = self.cipher.open(&sealed)?;
        Ok(Bytes::from(plain))
    }
}

/// Seals frames before handing them to an inner writer
pub struct SecureFrameWriter<W> {
    inner: W,
    cipher: Cipher,
}

impl<W: FrameWriter> SecureFrameWriter<W> {
    pub fn new(inner: W, key: &[u8; KEY_LEN]) -> Result<Self, TransportError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
        })
    }
}

#[async_trait]
impl<W: FrameWriter> FrameWriter for SecureFrameWriter<W> {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        // Rejected before sealing so the nonce counter stays in step
        if frame.len() + TAG_LEN > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len() + TAG_LEN));
        }
        let sealed = self.cipher.seal(&frame)?;
        self.inner.send(Bytes::from(sealed)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
