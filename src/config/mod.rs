//! Configuration management

use crate::crypto::DEFAULT_PBKDF2_ITERATIONS;
use crate::link::LinkConfig;
use crate::protocol::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, KEEPALIVE_CHECK_INTERVAL, MAX_LINK_IDLE,
};
use crate::tunnel::{
    ChannelSettings, TunnelConfig, DEFAULT_READ_CHUNK, DEFAULT_UDP_IDLE_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default server listen address
pub const DEFAULT_LISTEN: &str = ":10000";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Link timing and sizing
    #[serde(default)]
    pub link: LinkSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address; a bare `:port` means every interface
    pub listen: String,
    /// Shared secret for enciphered framing
    pub secret: Option<String>,
    /// TLS certificate chain (PEM)
    pub tls_cert: Option<String>,
    /// TLS private key (PEM)
    pub tls_key: Option<String>,
    /// Maximum concurrent links
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            secret: None,
            tls_cert: None,
            tls_key: None,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// The listen address in a form `TcpListener::bind` accepts
    pub fn listen_addr(&self) -> String {
        normalize_listen(&self.listen)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Shared secret for enciphered framing
    pub secret: Option<String>,
    /// CA certificate (PEM) trusted for TLS
    pub tls_ca: Option<String>,
    /// Server name expected in the server certificate
    pub tls_server_name: Option<String>,
    /// Tunnels opened on every connect, as `f|r[:proto]:lhost:lport:rhost:rport`
    pub tunnels: Vec<String>,
    /// Delay before reconnecting (seconds)
    pub reconnect_delay: u64,
    /// Connect timeout (seconds)
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:10000".to_string(),
            secret: None,
            tls_ca: None,
            tls_server_name: None,
            tunnels: Vec::new(),
            reconnect_delay: 1,
            connect_timeout: 10,
        }
    }
}

impl ClientConfig {
    /// Parse every configured tunnel
    pub fn tunnel_configs(&self) -> Result<Vec<TunnelConfig>, crate::Error> {
        self.tunnels
            .iter()
            .map(|spec| spec.parse().map_err(crate::Error::from))
            .collect()
    }
}

/// Link timing and sizing, durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub keepalive_interval: u64,
    pub write_timeout: u64,
    pub keepalive_check_interval: u64,
    pub max_idle: u64,
    pub request_timeout: u64,
    pub outbound_capacity: usize,
    /// Channel socket read size in bytes
    pub read_chunk: usize,
    pub udp_idle_timeout: u64,
    /// PBKDF2 iterations applied to a shared secret
    pub pbkdf2_iterations: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            write_timeout: DEFAULT_WRITE_TIMEOUT.as_secs(),
            keepalive_check_interval: KEEPALIVE_CHECK_INTERVAL.as_secs(),
            max_idle: MAX_LINK_IDLE.as_secs(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT.as_secs(),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl LinkSettings {
    /// Settings for one link
    pub fn link_config(&self, id: u32, is_server_side: bool) -> LinkConfig {
        let write_timeout = Duration::from_secs(self.write_timeout);
        LinkConfig {
            id,
            is_server_side,
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            write_timeout,
            keepalive_check_interval: Duration::from_secs(self.keepalive_check_interval),
            max_idle: Duration::from_secs(self.max_idle),
            request_timeout: Duration::from_secs(self.request_timeout),
            outbound_capacity: self.outbound_capacity,
            channel: ChannelSettings {
                read_chunk: self.read_chunk.max(1),
                udp_idle_timeout: Duration::from_secs(self.udp_idle_timeout),
                dial_timeout: write_timeout,
            },
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or env-filter directives (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Map `:port` to `0.0.0.0:port`
pub fn normalize_listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig {
            tunnels: vec!["f:127.0.0.1:8080:127.0.0.1:80".to_string()],
            ..ClientConfig::default()
        }),
        link: LinkSettings::default(),
        logging: LoggingConfig::default(),
    }
}
