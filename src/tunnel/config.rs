//! Tunnel configuration

use super::TunnelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Forwarded transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Proto {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(TunnelError::InvalidConfig(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }
}

/// One endpoint's view of a port-forward
///
/// The endpoint with `reverse = false` listens on `local_host:local_port`;
/// the endpoint with `reverse = true` dials it. The two halves of one tunnel
/// carry the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Zero asks the receiving manager to allocate one
    #[serde(rename = "ID", default)]
    pub id: u32,
    #[serde(rename = "Proto", default)]
    pub proto: Proto,
    #[serde(rename = "LocalHost")]
    pub local_host: String,
    #[serde(rename = "LocalPort")]
    pub local_port: u16,
    #[serde(rename = "RemoteHost")]
    pub remote_host: String,
    #[serde(rename = "RemotePort")]
    pub remote_port: u16,
    #[serde(rename = "Reverse", default)]
    pub reverse: bool,
}

impl TunnelConfig {
    pub fn new(
        proto: Proto,
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        reverse: bool,
    ) -> Self {
        Self {
            id: 0,
            proto,
            local_host: local_host.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            reverse,
        }
    }

    /// The peer's half: addresses swapped, direction flipped, ID left for
    /// the peer to assign
    pub fn remote_config(&self) -> Self {
        Self {
            id: 0,
            proto: self.proto,
            local_host: self.remote_host.clone(),
            local_port: self.remote_port,
            remote_host: self.local_host.clone(),
            remote_port: self.local_port,
            reverse: !self.reverse,
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// `local_host:local_port`, with an empty host meaning every interface
    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, self.local_port)
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.reverse { "<-" } else { "->" };
        write!(
            f,
            "{}: L({}:{}) {} R({}:{})",
            self.proto, self.local_host, self.local_port, arrow, self.remote_host, self.remote_port
        )
    }
}

/// Parse `f|r[:tcp|udp]:local_host:local_port:remote_host:remote_port`
impl FromStr for TunnelConfig {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 5 {
            parts.insert(1, "tcp");
        }
        if parts.len() != 6 {
            return Err(TunnelError::InvalidConfig(format!(
                "expected f|r[:proto]:local_host:local_port:remote_host:remote_port, got {}",
                s
            )));
        }

        let reverse = match parts[0] {
            "r" | "R" => true,
            "f" | "F" => false,
            other => {
                return Err(TunnelError::InvalidConfig(format!(
                    "unknown direction: {}",
                    other
                )))
            }
        };
        let proto = parts[1].parse()?;
        let local_port = parse_port(parts[3])?;
        let remote_port = parse_port(parts[5])?;

        Ok(Self::new(
            proto, parts[2], local_port, parts[4], remote_port, reverse,
        ))
    }
}

fn parse_port(s: &str) -> Result<u16, TunnelError> {
    s.trim()
        .parse()
        .map_err(|_| TunnelError::InvalidConfig(format!("invalid port: {}", s)))
}

/// Join a host and port, bracketing IPv6 literals and mapping an empty host
/// to the unspecified address
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.is_empty() {
        format!("0.0.0.0:{}", port)
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_config_mirrors() {
        let cfg = TunnelConfig::new(Proto::Tcp, "127.0.0.1", 8080, "10.0.0.2", 80, false).with_id(7);
        let remote = cfg.remote_config();

        assert_eq!(remote.id, 0);
        assert_eq!(remote.local_host, "10.0.0.2");
        assert_eq!(remote.local_port, 80);
        assert_eq!(remote.remote_host, "127.0.0.1");
        assert_eq!(remote.remote_port, 8080);
        assert!(remote.reverse);

        let back = remote.remote_config();
        assert_eq!(back, cfg.with_id(0));
    }

    #[test]
    fn test_json_field_names() {
        let cfg = TunnelConfig::new(Proto::Udp, "a", 1, "b", 2, true);
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(
            json,
            r#"{"ID":0,"Proto":"udp","LocalHost":"a","LocalPort":1,"RemoteHost":"b","RemotePort":2,"Reverse":true}"#
        );

        let parsed: TunnelConfig = serde_json::from_str(
            r#"{"Proto":"tcp","LocalHost":"x","LocalPort":10,"RemoteHost":"y","RemotePort":20}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, 0);
        assert!(!parsed.reverse);
    }

    #[test]
    fn test_parse_tunnel_spec() {
        let cfg: TunnelConfig = "f:127.0.0.1:2222:10.0.0.5:22".parse().unwrap();
        assert_eq!(cfg.proto, Proto::Tcp);
        assert!(!cfg.reverse);
        assert_eq!(cfg.local_port, 2222);
        assert_eq!(cfg.remote_host, "10.0.0.5");

        let cfg: TunnelConfig = "R:udp::5353:dns.local:53".parse().unwrap();
        assert_eq!(cfg.proto, Proto::Udp);
        assert!(cfg.reverse);
        assert_eq!(cfg.local_host, "");
        assert_eq!(cfg.local_addr(), "0.0.0.0:5353");
    }

    #[test]
    fn test_parse_tunnel_spec_errors() {
        assert!("x:a:1:b:2".parse::<TunnelConfig>().is_err());
        assert!("f:sctp:a:1:b:2".parse::<TunnelConfig>().is_err());
        assert!("f:a:port:b:2".parse::<TunnelConfig>().is_err());
        assert!("f:a:1".parse::<TunnelConfig>().is_err());
    }

    #[test]
    fn test_display() {
        let cfg = TunnelConfig::new(Proto::Tcp, "h1", 1, "h2", 2, true);
        assert_eq!(cfg.to_string(), "tcp: L(h1:1) <- R(h2:2)");
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("localhost", 80), "localhost:80");
    }
}
