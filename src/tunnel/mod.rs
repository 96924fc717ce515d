//! Tunnel layer - port-forwards multiplexed over a link
//!
//! Provides:
//! - TMSG encoding/decoding
//! - Tunnel configuration and its mirrored remote half
//! - Process-wide listen registry
//! - Channels pumping bytes between local sockets and the link
//! - The per-link tunnel manager

mod channel;
mod config;
mod forward;
mod listen;
mod manager;
mod message;

pub use channel::{Channel, ChannelPool};
pub use config::{Proto, TunnelConfig};
pub use forward::{Tunnel, TunnelMode};
pub use listen::{ListenKey, ListenRegistry};
pub use manager::TunnelManager;
pub use message::{Tmsg, TmsgType, TMSG_HEADER_SIZE};

use crate::protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel not found: {0}")]
    NotFound(u32),

    #[error("Channel not found: {tunnel}:{channel}")]
    ChannelNotFound { tunnel: u32, channel: u32 },

    #[error("Tunnel ID already in use: {0}")]
    IdInUse(u32),

    #[error("Tunnel ID space exhausted")]
    IdExhausted,

    #[error("Listen address already registered: {0}")]
    ListenAddressInUse(String),

    #[error("Invalid tunnel config: {0}")]
    InvalidConfig(String),

    #[error("Dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Short write: {written} < {expected}")]
    ShortWrite { written: usize, expected: usize },

    #[error("Channel idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Link closed")]
    LinkClosed,

    #[error("Tunnel manager closed")]
    ManagerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Default size of one local socket read
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// Default inactivity limit for UDP channels
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(6);

/// Default bound on dialing a tunnel target
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-channel tuning
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Local socket read size
    pub read_chunk: usize,
    /// UDP channels end after this long without local traffic
    pub udp_idle_timeout: Duration,
    /// Bound on dialing the target of a dialing tunnel
    pub dial_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}
