//! # otunnel
//!
//! Secure port-forwarding tunnels multiplexed over a single link.
//!
//! Two endpoints share one framed connection (plain TCP, TLS, or enciphered
//! with a shared secret) and run any number of TCP/UDP port-forwards and
//! control requests over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                        Link                          │
//! │     (receive/send tasks, keepalive, ping, shutdown)  │
//! ├──────────────────────────┬──────────────────────────┤
//! │     Session Manager      │      Tunnel Manager       │
//! │  (correlated requests,   │  (forward/reverse tunnels │
//! │   action routing)        │   and their channels)     │
//! ├──────────────────────────┴──────────────────────────┤
//! │                Framed Connection                     │
//! │       (length-prefixed, optionally enciphered)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 TCP / TLS / in-memory                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Opening a tunnel is itself a session request (`/tunnel`): the peer
//! creates the mirrored half, and the local half takes the ID the peer
//! assigned. The half with `reverse = false` listens; the other dials.

pub mod config;
pub mod crypto;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use link::{Link, LinkConfig, LinkError};
pub use tunnel::{Proto, TunnelConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port of the link server
pub const DEFAULT_PORT: u16 = 10000;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Link error: {0}")]
    Link(#[from] link::LinkError),

    #[error("Configuration error: {0}")]
    Config(String),
}
