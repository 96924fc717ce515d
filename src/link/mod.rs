//! Link: one multiplexed connection between two endpoints
//!
//! A link owns a [`FramedConn`](crate::transport::FramedConn) and runs a
//! receive task, a send task and a keepalive task over it. Session and tunnel
//! traffic share the one outbound queue drained by the send task.

mod handler;
mod mux;

pub use handler::{
    EchoHandler, TunnelCreateHandler, TunnelCreated, ECHO_ACTION, STATUS_BAD_TUNNEL_CONFIG,
    STATUS_CREATE_TUNNEL_FAILED, TUNNEL_ACTION,
};
pub use mux::Link;

use crate::protocol::{
    ProtocolError, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, KEEPALIVE_CHECK_INTERVAL, MAX_LINK_IDLE,
};
use crate::session::SessionError;
use crate::transport::TransportError;
use crate::tunnel::{ChannelSettings, TunnelError};
use std::time::Duration;
use thiserror::Error;

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link is shut down")]
    Shutdown,

    #[error("Timeout")]
    Timeout,

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Link is already bound to a connection")]
    AlreadyBound,

    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Link settings
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Identifier used in logs (assigned by the hello exchange)
    pub id: u32,
    /// Server-side links allocate odd session and tunnel IDs, client-side even
    pub is_server_side: bool,
    /// Idle time after which the keepalive loop pings
    pub keepalive_interval: Duration,
    /// Bound on each connection write, each ping and the tunnel-open request
    pub write_timeout: Duration,
    /// First and post-ping keepalive check delay
    pub keepalive_check_interval: Duration,
    /// Idle ceiling after which a peer that fails pings is treated as dead
    pub max_idle: Duration,
    /// Default bound for session requests
    pub request_timeout: Duration,
    pub outbound_capacity: usize,
    pub channel: ChannelSettings,
}

impl LinkConfig {
    pub fn server(id: u32) -> Self {
        Self {
            id,
            is_server_side: true,
            ..Self::default()
        }
    }

    pub fn client(id: u32) -> Self {
        Self {
            id,
            is_server_side: false,
            ..Self::default()
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            id: 0,
            is_server_side: false,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            keepalive_check_interval: KEEPALIVE_CHECK_INTERVAL,
            max_idle: MAX_LINK_IDLE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            channel: ChannelSettings::default(),
        }
    }
}
