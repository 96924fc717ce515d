//! Plain TCP connections

use super::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `addr`, failing with `Timeout` after `timeout`
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Control frames are small; avoid Nagle delays
    stream.set_nodelay(true).ok();
    Ok(stream)
}
