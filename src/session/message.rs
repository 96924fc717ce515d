//! Session message (EMSG) encoding and the request/response envelopes
//!
//! EMSG format:
//! ```text
//! +--------+--------+--------+--------+--------+------------------+
//! |  Type  |          Session ID (4B, LE)      |     Payload      |
//! +--------+--------+--------+--------+--------+------------------+
//! ```

use crate::protocol::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// EMSG header size in bytes
pub const EMSG_HEADER_SIZE: usize = 5;

/// Response status for a handled request
pub const STATUS_SUCCESS: &str = "success";
/// Response status when the request envelope is not valid JSON
pub const STATUS_BAD_REQUEST: &str = "json-unmarshal-request-error";
/// Response status when no route matches or the handler failed
pub const STATUS_DISPATCH_FAILED: &str = "dispatch-request-error";
/// Response status when the handler result could not be encoded
pub const STATUS_BAD_RESPONSE: &str = "json-marshal-response-error";

/// EMSG message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmsgType {
    Request = 0x01,
    Response = 0x02,
}

impl TryFrom<u8> for EmsgType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EmsgType::Request),
            0x02 => Ok(EmsgType::Response),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// A session message
#[derive(Debug, Clone)]
pub struct Emsg {
    pub msg_type: EmsgType,
    pub id: u32,
    pub payload: Bytes,
}

impl Emsg {
    pub fn request(id: u32, payload: Bytes) -> Self {
        Self {
            msg_type: EmsgType::Request,
            id,
            payload,
        }
    }

    pub fn response(id: u32, payload: Bytes) -> Self {
        Self {
            msg_type: EmsgType::Response,
            id,
            payload,
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EMSG_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type as u8);
        buf.put_u32_le(self.id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < EMSG_HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: EMSG_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let msg_type = EmsgType::try_from(data.get_u8())?;
        let id = data.get_u32_le();
        Ok(Self {
            msg_type,
            id,
            payload: data,
        })
    }
}

/// Request envelope carried in a Request EMSG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Body", with = "base64_body", default)]
    pub body: Bytes,
}

impl Request {
    pub fn new(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            action: action.into(),
            body: body.into(),
        }
    }
}

/// Response envelope carried in a Response EMSG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Body", with = "base64_body", default)]
    pub body: Bytes,
}

impl Response {
    /// Successful response with a body
    pub fn success(body: impl Into<Bytes>) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            body: body.into(),
        }
    }

    /// Bodyless response with the given status
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Raw bytes travel as base64 strings; `null` decodes as empty
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Bytes::new()),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
        }
    }
}
