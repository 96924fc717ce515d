//! Link-level protocol definitions and constants
//!
//! Every framed-connection message produced by the link layer starts with a
//! one byte kind:
//! ```text
//! +--------+------------------------------+
//! |  Kind  |         Kind body            |
//! +--------+------------------------------+
//! ```
//! - `Session`: body is an EMSG (see [`crate::session::Emsg`])
//! - `Tunnel`: body is a TMSG (see [`crate::tunnel::Tmsg`])
//! - `PingRequest` / `PingResponse`: body is a 4 byte little-endian ping ID

mod outbound;

pub use outbound::{Outbound, OutboundReceiver, QueueClosed};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty link message")]
    EmptyMessage,

    #[error("Unknown link message kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid ping message: {0} bytes")]
    InvalidPing(usize),

    #[error("Message too short: {actual} < {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
}

/// Length of a ping body in bytes
pub const PING_BODY_LEN: usize = 4;

/// Default keepalive interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default write timeout (also bounds pings and the tunnel-open RPC)
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the keepalive loop checks idleness
pub const KEEPALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(6);

/// Idle ceiling after which a failing peer is considered dead
pub const MAX_LINK_IDLE: Duration = Duration::from_secs(60);

/// Default bound for a session request waiting on its response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest encoded link message, leaving room for the enciphered framing tag
pub const MAX_LINK_MESSAGE_SIZE: usize =
    crate::transport::MAX_FRAME_SIZE - crate::crypto::TAG_LEN;

/// Default capacity of the shared outbound queue
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Top-level link message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkKind {
    /// Session request/response traffic
    Session = 0x01,
    /// Tunnel channel traffic
    Tunnel = 0x02,
    /// Keepalive probe
    PingRequest = 0x03,
    /// Keepalive echo
    PingResponse = 0x04,
}

impl TryFrom<u8> for LinkKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(LinkKind::Session),
            0x02 => Ok(LinkKind::Tunnel),
            0x03 => Ok(LinkKind::PingRequest),
            0x04 => Ok(LinkKind::PingResponse),
            _ => Err(ProtocolError::UnknownKind(value)),
        }
    }
}

/// One link message, i.e. the content of one framed-connection message
#[derive(Debug, Clone)]
pub struct LinkMessage {
    /// Top-level kind
    pub kind: LinkKind,
    /// Kind specific body
    pub body: Bytes,
}

impl LinkMessage {
    pub fn new(kind: LinkKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    /// Create a ping request carrying `id`
    pub fn ping_request(id: u32) -> Self {
        Self::new(LinkKind::PingRequest, encode_ping(id))
    }

    /// Echo a ping request body back
    pub fn ping_response(body: Bytes) -> Self {
        Self::new(LinkKind::PingResponse, body)
    }

    /// Length of the encoded message
    pub fn encoded_len(&self) -> usize {
        1 + self.body.len()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body.len());
        buf.put_u8(self.kind as u8);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Decode from wire bytes
    ///
    /// An unknown kind is reported as [`ProtocolError::UnknownKind`], which the
    /// link treats as fatal.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        let kind = LinkKind::try_from(data.get_u8())?;
        Ok(Self { kind, body: data })
    }
}

/// Encode a ping ID body
pub fn encode_ping(id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(PING_BODY_LEN);
    buf.put_u32_le(id);
    buf.freeze()
}

/// Decode a ping ID body
pub fn decode_ping(mut body: &[u8]) -> Result<u32, ProtocolError> {
    if body.len() != PING_BODY_LEN {
        return Err(ProtocolError::InvalidPing(body.len()));
    }
    Ok(body.get_u32_le())
}
