//! Correlated request/response RPC over a link
//!
//! Each endpoint allocates session IDs from its own parity sequence, so
//! responses can be matched to their requests without coordination. Inbound
//! requests are routed by action to a [`RequestHandler`].

mod manager;
mod message;
mod pool;
mod router;

pub use manager::SessionManager;
pub use message::{
    Emsg, EmsgType, Request, Response, EMSG_HEADER_SIZE, STATUS_BAD_REQUEST, STATUS_BAD_RESPONSE,
    STATUS_DISPATCH_FAILED, STATUS_SUCCESS,
};
pub use pool::{Session, SessionPool};
pub use router::{RequestHandler, Route, Router};

use crate::protocol::ProtocolError;
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session ID space exhausted")]
    IdExhausted,

    #[error("Session {0} not found")]
    NotFound(u32),

    #[error("Session {0} already used")]
    Consumed(u32),

    #[error("Link closed")]
    LinkClosed,

    #[error("Session {0} timed out")]
    Timeout(u32),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("No handler for action: {0}")]
    NoHandler(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
