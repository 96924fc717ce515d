//! Tunnel message (TMSG) encoding/decoding
//!
//! TMSG format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |       Tunnel ID (4B, LE)          |
//! +--------+--------+--------+--------+--------+
//! |       Channel ID (4B, LE)         | Payload
//! +--------+--------+--------+--------+--------
//! ```

use crate::protocol::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// TMSG header size in bytes
pub const TMSG_HEADER_SIZE: usize = 9;

/// TMSG message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmsgType {
    /// Payload read from a local socket
    ChannelForward = 0x01,
    /// The sending side closed its end of the channel
    ChannelClose = 0x02,
}

impl TryFrom<u8> for TmsgType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TmsgType::ChannelForward),
            0x02 => Ok(TmsgType::ChannelClose),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// A tunnel message
#[derive(Debug, Clone)]
pub struct Tmsg {
    pub msg_type: TmsgType,
    pub tunnel_id: u32,
    pub channel_id: u32,
    pub payload: Bytes,
}

impl Tmsg {
    pub fn forward(tunnel_id: u32, channel_id: u32, payload: Bytes) -> Self {
        Self {
            msg_type: TmsgType::ChannelForward,
            tunnel_id,
            channel_id,
            payload,
        }
    }

    pub fn close(tunnel_id: u32, channel_id: u32) -> Self {
        Self {
            msg_type: TmsgType::ChannelClose,
            tunnel_id,
            channel_id,
            payload: Bytes::new(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TMSG_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type as u8);
        buf.put_u32_le(self.tunnel_id);
        buf.put_u32_le(self.channel_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < TMSG_HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: TMSG_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let msg_type = TmsgType::try_from(data.get_u8())?;
        let tunnel_id = data.get_u32_le();
        let channel_id = data.get_u32_le();
        Ok(Self {
            msg_type,
            tunnel_id,
            channel_id,
            payload: data,
        })
    }
}
