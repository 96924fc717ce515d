//! Transport layer: framed message connections
//!
//! Provides the message-oriented duplex connection a link runs over:
//! - Length-prefixed framing over any byte stream (TCP, TLS)
//! - In-memory pairs for tests and embedding
//! - Enciphered framing keyed from a shared secret
//! - JSON hello exchanged before the link is bound
//! - TLS acceptor/connector helpers (feature `tls`)

mod framed;
mod handshake;
mod memory;
mod secure;
mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use framed::{StreamFrameReader, StreamFrameWriter};
pub use handshake::{client_hello, server_hello, HELLO_ACTION};
pub use memory::memory_pair;
pub use secure::{SecureFrameReader, SecureFrameWriter};
pub use tcp::connect;

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, TlsClient, TlsServer, DEFAULT_SERVER_NAME};

use crate::crypto::{CryptoError, LinkKeys, Role};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest frame accepted in either direction (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame too large: {0} > {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// EOF, reset and closed-pipe errors all mean the peer is gone
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Receiving half of a framed connection
#[async_trait]
pub trait FrameReader: Send {
    /// Receive exactly one frame as sent by the peer
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// Sending half of a framed connection
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A bidirectional framed connection
pub struct FramedConn {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
}

impl FramedConn {
    pub fn new(reader: impl FrameReader + 'static, writer: impl FrameWriter + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Length-prefixed framing over a byte stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::new(StreamFrameReader::new(read), StreamFrameWriter::new(write))
    }

    /// Wrap both directions in enciphered framing keyed from `secret`
    pub fn secure(self, secret: &[u8], iterations: u32, role: Role) -> Result<Self, TransportError> {
        let keys = crate::crypto::derive_link_keys(secret, iterations)?;
        self.secure_with_keys(&keys, role)
    }

    /// Same as [`secure`](Self::secure) with keys derived beforehand
    pub fn secure_with_keys(self, keys: &LinkKeys, role: Role) -> Result<Self, TransportError> {
        let (seal_key, open_key) = keys.for_role(role);
        Ok(Self::new(
            SecureFrameReader::new(self.reader, open_key)?,
            SecureFrameWriter::new(self.writer, seal_key)?,
        ))
    }

    pub async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.reader.recv().await
    }

    pub async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.writer.send(frame).await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }

    /// Split into halves owned by separate tasks
    pub fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl FrameReader for Box<dyn FrameReader> {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        (**self).recv().await
    }
}

#[async_trait]
impl FrameWriter for Box<dyn FrameWriter> {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

impl std::fmt::Debug for FramedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConn").finish_non_exhaustive()
    }
}
