//! JSON hello exchanged before a link is bound

use super::{FramedConn, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Action requested by a connecting client
pub const HELLO_ACTION: &str = "new";

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    action: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hello: Option<String>,
}

async fn send_json<T: Serialize>(conn: &mut FramedConn, value: &T) -> Result<(), TransportError> {
    let body = serde_json::to_vec(value).map_err(|e| TransportError::Handshake(e.to_string()))?;
    conn.send(Bytes::from(body)).await
}

async fn recv_json<T: for<'de> Deserialize<'de>>(conn: &mut FramedConn) -> Result<T, TransportError> {
    let frame = conn.recv().await?;
    serde_json::from_slice(&frame).map_err(|e| TransportError::Handshake(e.to_string()))
}

/// Client side: announce a new link and return the ID the server assigned
pub async fn client_hello(conn: &mut FramedConn) -> Result<u32, TransportError> {
    send_json(
        conn,
        &HelloRequest {
            action: HELLO_ACTION.to_string(),
        },
    )
    .await?;

    let reply: HelloReply = recv_json(conn).await?;
    let link_id = reply
        .link_id
        .ok_or_else(|| TransportError::Handshake("reply has no link_id".to_string()))?;
    debug!(link = link_id, "hello accepted");
    Ok(link_id)
}

/// Server side: wait for the client's hello and answer with `link_id`
pub async fn server_hello(conn: &mut FramedConn, link_id: u32) -> Result<(), TransportError> {
    let request: HelloRequest = recv_json(conn).await?;
    debug!(link = link_id, action = %request.action, "hello received");

    send_json(
        conn,
        &HelloReply {
            link_id: Some(link_id),
            hello: Some("world".to_string()),
        },
    )
    .await
}
