//! Built-in request handlers every link serves

use crate::session::{Request, RequestHandler, Response, SessionError};
use crate::tunnel::{TunnelConfig, TunnelManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Diagnostic action answering with the request body
pub const ECHO_ACTION: &str = "/echo";

/// Remote tunnel creation
pub const TUNNEL_ACTION: &str = "/tunnel";

/// The `/tunnel` body is not a tunnel config
pub const STATUS_BAD_TUNNEL_CONFIG: &str = "load-tunnel-map-error";

/// The tunnel config was valid but creating it failed
pub const STATUS_CREATE_TUNNEL_FAILED: &str = "create-tunnel-failed";

/// Success body of `/tunnel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCreated {
    #[serde(rename = "ID")]
    pub id: u32,
}

/// Answers `/echo`
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Request) -> Result<Response, SessionError> {
        Ok(Response::success(request.body))
    }
}

/// Answers `/tunnel` by creating the described tunnel locally
pub struct TunnelCreateHandler {
    tunnels: Arc<TunnelManager>,
}

impl TunnelCreateHandler {
    pub fn new(tunnels: Arc<TunnelManager>) -> Self {
        Self { tunnels }
    }
}

#[async_trait]
impl RequestHandler for TunnelCreateHandler {
    async fn handle(&self, request: Request) -> Result<Response, SessionError> {
        let cfg: TunnelConfig = match serde_json::from_slice(&request.body) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("load tunnel config failed: {}", e);
                return Ok(Response::status(STATUS_BAD_TUNNEL_CONFIG));
            }
        };

        match self.tunnels.tunnel_create(cfg).await {
            Ok(tunnel) => {
                let body = serde_json::to_vec(&TunnelCreated { id: tunnel.id() })?;
                Ok(Response::success(body))
            }
            Err(e) => {
                error!("create tunnel failed: {}", e);
                Ok(Response::status(STATUS_CREATE_TUNNEL_FAILED))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Outbound, OutboundReceiver};
    use crate::session::STATUS_SUCCESS;
    use crate::tunnel::{ChannelSettings, Proto};
    use bytes::Bytes;

    fn tunnels() -> (Arc<TunnelManager>, OutboundReceiver) {
        let (outbound, rx) = Outbound::channel(8);
        let manager = TunnelManager::new(true, outbound, ChannelSettings::default());
        (Arc::new(manager), rx)
    }

    #[tokio::test]
    async fn test_echo_returns_body() {
        let response = EchoHandler
            .handle(Request::new(ECHO_ACTION, Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(&response.body[..], b"abc");
    }

    #[tokio::test]
    async fn test_tunnel_create_returns_id() {
        let (manager, _rx) = tunnels();
        let handler = TunnelCreateHandler::new(Arc::clone(&manager));
        let cfg = TunnelConfig::new(Proto::Tcp, "127.0.0.1", 9, "127.0.0.1", 0, true);

        let response = handler
            .handle(Request::new(TUNNEL_ACTION, serde_json::to_vec(&cfg).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, STATUS_SUCCESS);

        let created: TunnelCreated = serde_json::from_slice(&response.body).unwrap();
        assert!(manager.get(created.id).is_some());
        assert_eq!(&response.body[..], format!(r#"{{"ID":{}}}"#, created.id).as_bytes());
        manager.close();
    }

    #[tokio::test]
    async fn test_tunnel_create_statuses() {
        let (manager, _rx) = tunnels();
        let handler = TunnelCreateHandler::new(Arc::clone(&manager));

        let response = handler
            .handle(Request::new(TUNNEL_ACTION, Bytes::from_static(b"not json")))
            .await
            .unwrap();
        assert_eq!(response.status, STATUS_BAD_TUNNEL_CONFIG);

        manager.close();
        let cfg = TunnelConfig::new(Proto::Tcp, "127.0.0.1", 9, "127.0.0.1", 0, true);
        let response = handler
            .handle(Request::new(TUNNEL_ACTION, serde_json::to_vec(&cfg).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, STATUS_CREATE_TUNNEL_FAILED);
    }
}
