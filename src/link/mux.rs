//! Link tasks: receive, send and keepalive

use super::{
    EchoHandler, LinkConfig, LinkError, TunnelCreateHandler, TunnelCreated, ECHO_ACTION,
    TUNNEL_ACTION,
};
use crate::protocol::{
    decode_ping, LinkKind, LinkMessage, Outbound, OutboundReceiver, ProtocolError,
};
use crate::session::{Request, Response, Route, Router, SessionError, SessionManager};
use crate::transport::{FrameReader, FrameWriter, FramedConn, TransportError};
use crate::tunnel::{Tunnel, TunnelConfig, TunnelManager};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct LinkInner {
    config: LinkConfig,
    outbound: Outbound,
    /// Handed to the send task by `bind`
    outbound_rx: Mutex<Option<OutboundReceiver>>,
    sessions: SessionManager,
    tunnels: Arc<TunnelManager>,
    next_ping: AtomicU32,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    last_recv: Mutex<Instant>,
    bound: AtomicBool,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    /// Receive and send tasks still running
    running: watch::Sender<usize>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        self.sessions.close();
        self.tunnels.close();
    }
}

/// One multiplexed connection to a peer
///
/// Cloning is cheap; all clones drive the same link.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Create an unbound link serving the built-in `/echo` and `/tunnel` actions
    pub fn new(config: LinkConfig) -> Result<Self, LinkError> {
        Self::with_routes(config, Vec::new())
    }

    /// Create an unbound link serving the built-in actions plus `routes`
    ///
    /// Built-in actions are matched first.
    pub fn with_routes(
        config: LinkConfig,
        routes: impl IntoIterator<Item = Route>,
    ) -> Result<Self, LinkError> {
        let (outbound, outbound_rx) = Outbound::channel(config.outbound_capacity);
        let tunnels = Arc::new(TunnelManager::new(
            config.is_server_side,
            outbound.clone(),
            config.channel,
        ));

        let mut router = Router::new();
        router.add_route(Route::new(ECHO_ACTION, Arc::new(EchoHandler))?);
        router.add_route(Route::new(
            TUNNEL_ACTION,
            Arc::new(TunnelCreateHandler::new(Arc::clone(&tunnels))),
        )?);
        router.add_routes(routes);

        let sessions = SessionManager::new(
            config.is_server_side,
            outbound.clone(),
            router,
            config.request_timeout,
        );

        Ok(Self {
            inner: Arc::new(LinkInner {
                config,
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                sessions,
                tunnels,
                next_ping: AtomicU32::new(1),
                pings: Mutex::new(HashMap::new()),
                last_recv: Mutex::new(Instant::now()),
                bound: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stop: watch::channel(false).0,
                shutdown: watch::channel(false).0,
                running: watch::channel(0).0,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.config.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn tunnel_manager(&self) -> &Arc<TunnelManager> {
        &self.inner.tunnels
    }

    pub fn tunnel(&self, id: u32) -> Option<Arc<Tunnel>> {
        self.inner.tunnels.get(id)
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Pings still waiting for their response
    pub fn pending_pings(&self) -> usize {
        lock(&self.inner.pings).len()
    }

    /// Time since anything was last received
    pub fn idle(&self) -> Duration {
        lock(&self.inner.last_recv).elapsed()
    }

    fn touch(&self) {
        *lock(&self.inner.last_recv) = Instant::now();
    }

    /// Run the link over `conn`
    ///
    /// Spawns the receive, send and keepalive tasks and a best-effort
    /// warm-up ping. A link can be bound once.
    pub fn bind(&self, conn: FramedConn) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Shutdown);
        }
        if self.inner.bound.swap(true, Ordering::SeqCst) {
            return Err(LinkError::AlreadyBound);
        }
        let outbound_rx = lock(&self.inner.outbound_rx)
            .take()
            .ok_or(LinkError::Shutdown)?;

        let (reader, writer) = conn.split();
        self.touch();
        self.inner.running.send_modify(|n| *n += 2);

        tokio::spawn(self.clone().recv_loop(reader));
        tokio::spawn(self.clone().send_loop(writer, outbound_rx));
        tokio::spawn(keepalive_loop(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.subscribe(),
            self.inner.config,
        ));

        let link = self.clone();
        tokio::spawn(async move {
            match link.ping().await {
                Ok(rtt) => debug!(link = link.id(), ?rtt, "warm-up ping"),
                Err(e) => debug!(link = link.id(), "warm-up ping failed: {}", e),
            }
        });

        info!(link = self.id(), "link bound");
        Ok(())
    }

    async fn recv_loop(self, mut reader: Box<dyn FrameReader>) {
        let mut stop = self.inner.stop.subscribe();
        loop {
            let frame = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                frame = reader.recv() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) if e.is_closed() => {
                    debug!(link = self.id(), "connection closed by peer");
                    break;
                }
                Err(e) => {
                    error!(link = self.id(), "recv failed: {}", e);
                    break;
                }
            };

            self.touch();
            match self.handle_message(frame).await {
                Ok(()) => {}
                Err(LinkError::Protocol(ProtocolError::UnknownKind(kind))) => {
                    error!(link = self.id(), "unknown link message kind {}", kind);
                    break;
                }
                Err(e) => warn!(link = self.id(), "drop inbound message: {}", e),
            }
        }

        self.stop();
        self.loop_exited();
    }

    async fn handle_message(&self, frame: Bytes) -> Result<(), LinkError> {
        let msg = LinkMessage::decode(frame)?;
        match msg.kind {
            LinkKind::Session => self.inner.sessions.handle_in(msg.body).await?,
            LinkKind::Tunnel => self.inner.tunnels.handle_in(msg.body).await?,
            LinkKind::PingRequest => {
                decode_ping(&msg.body)?;
                if self
                    .inner
                    .outbound
                    .send(LinkMessage::ping_response(msg.body))
                    .await
                    .is_err()
                {
                    debug!(link = self.id(), "drop ping response, link is shutting down");
                }
            }
            LinkKind::PingResponse => {
                let id = decode_ping(&msg.body)?;
                match lock(&self.inner.pings).remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!(link = self.id(), ping = id, "late ping response"),
                }
            }
        }
        Ok(())
    }

    async fn send_loop(self, mut writer: Box<dyn FrameWriter>, mut outbound_rx: OutboundReceiver) {
        let mut stop = self.inner.stop.subscribe();
        let write_timeout = self.inner.config.write_timeout;
        loop {
            let frame = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match tokio::time::timeout(write_timeout, writer.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(TransportError::FrameTooLarge(size))) => {
                    warn!(link = self.id(), size, "drop oversized outbound message");
                }
                Ok(Err(e)) => {
                    error!(link = self.id(), "send failed: {}", e);
                    break;
                }
                Err(_) => {
                    error!(link = self.id(), "send timed out after {:?}", write_timeout);
                    break;
                }
            }
        }

        // Late producers get QueueClosed from here on
        outbound_rx.close();
        if let Ok(Err(e)) = tokio::time::timeout(write_timeout, writer.close()).await {
            debug!(link = self.id(), "close connection: {}", e);
        }

        self.stop();
        self.loop_exited();
    }

    fn loop_exited(&self) {
        self.inner.running.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Probe the peer, returning the round-trip time
    ///
    /// Fails with `Timeout` after the write timeout and with `Shutdown` once
    /// the link is stopped.
    pub async fn ping(&self) -> Result<Duration, LinkError> {
        if self.is_stopped() {
            return Err(LinkError::Shutdown);
        }
        let id = self.inner.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pings).insert(id, tx);

        let started = Instant::now();
        let mut stop = self.inner.stop.subscribe();
        let outbound = &self.inner.outbound;
        let exchange = async {
            outbound
                .send(LinkMessage::ping_request(id))
                .await
                .map_err(|_| LinkError::Shutdown)?;
            tokio::select! {
                reply = rx => reply.map_err(|_| LinkError::Shutdown),
                _ = stop.wait_for(|stopped| *stopped) => Err(LinkError::Shutdown),
            }
        };

        let outcome = tokio::time::timeout(self.inner.config.write_timeout, exchange).await;
        lock(&self.inner.pings).remove(&id);
        match outcome {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Send a request to the peer and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response, LinkError> {
        self.inner
            .sessions
            .request(request)
            .await
            .map_err(request_error)
    }

    pub async fn request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, LinkError> {
        self.inner
            .sessions
            .request_timeout(request, timeout)
            .await
            .map_err(request_error)
    }

    /// Open a tunnel whose other half lives on the peer
    ///
    /// The peer creates the mirrored half first and assigns the ID; the
    /// local half is then created under the same ID. The peer's half is not
    /// rolled back if the local create fails.
    pub async fn open_tunnel(&self, config: TunnelConfig) -> Result<Arc<Tunnel>, LinkError> {
        let remote = config.remote_config();
        let body = serde_json::to_vec(&remote).map_err(SessionError::from)?;
        debug!(link = self.id(), "open tunnel {}", config);

        let response = self
            .request_timeout(Request::new(TUNNEL_ACTION, body), self.inner.config.write_timeout)
            .await?;
        if !response.is_success() {
            return Err(LinkError::RemoteRejected(response.status));
        }

        let created: TunnelCreated =
            serde_json::from_slice(&response.body).map_err(SessionError::from)?;
        let tunnel = self
            .inner
            .tunnels
            .tunnel_create(config.with_id(created.id))
            .await?;

        info!(link = self.id(), tunnel = tunnel.id(), "tunnel opened: {}", tunnel.config());
        Ok(tunnel)
    }

    /// Stop the receive and send tasks, leaving sessions and tunnels in place
    pub fn stop(&self) {
        let changed = self.inner.stop.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if changed {
            debug!(link = self.id(), "link stopped");
        }
    }

    /// Shut the link down, releasing every session, tunnel and ping waiter
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        self.stop();

        if let Some(mut outbound_rx) = lock(&self.inner.outbound_rx).take() {
            outbound_rx.close();
        }
        self.inner.sessions.close();
        self.inner.tunnels.close();
        lock(&self.inner.pings).clear();

        info!(link = self.id(), "link closed");
    }

    /// Wait until the receive and send tasks have exited
    ///
    /// Returns at once for a link that was never bound.
    pub async fn wait(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("is_server_side", &self.inner.config.is_server_side)
            .field("stopped", &self.is_stopped())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn request_error(err: SessionError) -> LinkError {
    match err {
        SessionError::Timeout(_) => LinkError::Timeout,
        SessionError::LinkClosed => LinkError::Shutdown,
        SessionError::MessageTooLarge { size, max } => LinkError::MessageTooLarge { size, max },
        err => LinkError::Session(err),
    }
}

async fn keepalive_loop(
    inner: Weak<LinkInner>,
    mut shutdown: watch::Receiver<bool>,
    config: LinkConfig,
) {
    let mut wait = config.keepalive_check_interval;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|down| *down) => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let link = Link { inner };

        if link.is_stopped() {
            wait = config.keepalive_check_interval;
            continue;
        }

        let idle = link.idle();
        wait = if idle < config.keepalive_interval {
            config.keepalive_interval - idle
        } else {
            match link.ping().await {
                Ok(rtt) => {
                    debug!(link = link.id(), ?rtt, "keepalive ping");
                }
                Err(e) if idle > config.max_idle => {
                    warn!(link = link.id(), ?idle, "peer is not responding ({}), stop link", e);
                    link.stop();
                }
                Err(e) => {
                    debug!(link = link.id(), ?idle, "keepalive ping failed: {}", e);
                }
            }
            config.keepalive_check_interval
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_ping;
    use crate::transport::memory_pair;

    fn fast_config(is_server_side: bool) -> LinkConfig {
        LinkConfig {
            is_server_side,
            write_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        }
    }

    fn bound_pair() -> (Link, Link) {
        let (a, b) = memory_pair(64);
        let server = Link::new(fast_config(true)).unwrap();
        let client = Link::new(fast_config(false)).unwrap();
        server.bind(a).unwrap();
        client.bind(b).unwrap();
        (server, client)
    }

    /// Next frame from a raw peer that is not a ping request
    async fn next_non_ping(conn: &mut FramedConn) -> LinkMessage {
        loop {
            let msg = LinkMessage::decode(conn.recv().await.unwrap()).unwrap();
            if msg.kind != LinkKind::PingRequest {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_echo_request() {
        let (server, client) = bound_pair();

        let response = client
            .request(Request::new(ECHO_ACTION, Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(&response.body[..], b"hello");

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_oversized_outbound_message_is_dropped() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Link::new(fast_config(true)).unwrap();
        let client = Link::new(fast_config(false)).unwrap();
        server.bind(FramedConn::from_stream(a)).unwrap();
        client.bind(FramedConn::from_stream(b)).unwrap();

        let body = Bytes::from(vec![0u8; crate::transport::MAX_FRAME_SIZE + 1]);
        client
            .inner
            .outbound
            .send_kind(LinkKind::Session, body)
            .await
            .unwrap();

        let response = client
            .request(Request::new(ECHO_ACTION, Bytes::from_static(b"still up")))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"still up");
        assert!(!client.is_stopped());

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_bind_once() {
        let (a, b) = memory_pair(4);
        let link = Link::new(fast_config(true)).unwrap();
        link.bind(a).unwrap();
        assert!(matches!(link.bind(b), Err(LinkError::AlreadyBound)));
        link.close();
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let (server, client) = bound_pair();

        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_millis(200));
        assert_eq!(client.pending_pings(), 0);

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_ping_timeout_then_recovers() {
        let (a, mut peer) = memory_pair(64);
        let link = Link::new(fast_config(false)).unwrap();
        link.bind(a).unwrap();

        assert!(matches!(link.ping().await, Err(LinkError::Timeout)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(link.pending_pings(), 0);

        // Start answering pings
        tokio::spawn(async move {
            while let Ok(frame) = peer.recv().await {
                let msg = LinkMessage::decode(frame).unwrap();
                if msg.kind == LinkKind::PingRequest {
                    let reply = LinkMessage::ping_response(msg.body).encode();
                    if peer.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        });

        link.ping().await.unwrap();
        assert_eq!(link.pending_pings(), 0);
        link.close();
    }

    #[tokio::test]
    async fn test_answers_ping_requests() {
        let (a, mut peer) = memory_pair(64);
        let link = Link::new(fast_config(true)).unwrap();
        link.bind(a).unwrap();

        let request = LinkMessage::ping_request(77).encode();
        peer.send(request).await.unwrap();

        let reply = next_non_ping(&mut peer).await;
        assert_eq!(reply.kind, LinkKind::PingResponse);
        assert_eq!(reply.body, encode_ping(77));
        link.close();
    }

    #[tokio::test]
    async fn test_empty_and_malformed_messages_are_dropped() {
        let (a, mut peer) = memory_pair(64);
        let link = Link::new(fast_config(true)).unwrap();
        link.bind(a).unwrap();

        peer.send(Bytes::new()).await.unwrap();
        peer.send(Bytes::from_static(&[LinkKind::Session as u8, 1]))
            .await
            .unwrap();
        peer.send(LinkMessage::ping_request(5).encode()).await.unwrap();

        let reply = next_non_ping(&mut peer).await;
        assert_eq!(reply.kind, LinkKind::PingResponse);
        assert!(!link.is_stopped());
        link.close();
    }

    #[tokio::test]
    async fn test_unknown_kind_stops_link() {
        let (a, mut peer) = memory_pair(64);
        let link = Link::new(fast_config(true)).unwrap();
        link.bind(a).unwrap();

        peer.send(Bytes::from_static(&[0x7f, 0, 0])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), link.wait())
            .await
            .unwrap();
        assert!(link.is_stopped());
        assert!(!link.is_closed());
        link.close();
    }

    #[tokio::test]
    async fn test_peer_disconnect_stops_link() {
        let (a, peer) = memory_pair(64);
        let link = Link::new(fast_config(true)).unwrap();
        link.bind(a).unwrap();

        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), link.wait())
            .await
            .unwrap();
        assert!(matches!(link.ping().await, Err(LinkError::Shutdown)));
        link.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_waiters() {
        let (a, _peer) = memory_pair(64);
        let link = Link::new(LinkConfig::client(9)).unwrap();
        link.bind(a).unwrap();

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move {
                link.request(Request::new(ECHO_ACTION, Bytes::new())).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let link = link.clone();
                tokio::spawn(async move { link.close() })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }

        assert!(matches!(waiter.await.unwrap(), Err(LinkError::Shutdown)));
        tokio::time::timeout(Duration::from_secs(5), link.wait())
            .await
            .unwrap();
        assert!(link.is_closed());
        assert!(matches!(
            link.request(Request::new(ECHO_ACTION, Bytes::new())).await,
            Err(LinkError::Shutdown)
        ));
        link.close();
    }

    #[tokio::test]
    async fn test_close_before_bind() {
        let (a, _peer) = memory_pair(4);
        let link = Link::new(LinkConfig::default()).unwrap();
        link.close();
        assert!(matches!(link.bind(a), Err(LinkError::Shutdown)));
        link.wait().await;
    }

    #[tokio::test]
    async fn test_keepalive_stops_dead_peer() {
        let (a, _peer) = memory_pair(64);
        let link = Link::new(LinkConfig {
            keepalive_interval: Duration::from_millis(100),
            keepalive_check_interval: Duration::from_millis(50),
            max_idle: Duration::from_millis(300),
            write_timeout: Duration::from_millis(100),
            ..LinkConfig::default()
        })
        .unwrap();
        link.bind(a).unwrap();

        tokio::time::timeout(Duration::from_secs(5), link.wait())
            .await
            .unwrap();
        assert!(link.is_stopped());
        assert!(link.idle() > Duration::from_millis(300));
        link.close();
    }
}
