//! One port-forward and its channels
//!
//! A tunnel is either the listening half (accepts local connections and
//! originates channels with fresh IDs) or the dialing half (dials its target
//! the first time it sees traffic for an unknown channel ID).

use super::config::join_host_port;
use super::{
    Channel, ChannelPool, ChannelSettings, ListenKey, ListenRegistry, Proto, Tmsg, TunnelConfig,
    TunnelError,
};
use crate::protocol::{LinkKind, Outbound};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, trace, warn};

/// Channel IDs remembered after close so late forwards are not re-dialed
const RECENTLY_CLOSED_CAPACITY: usize = 4096;

/// Payload held for one channel while its target is being dialed
const PENDING_DIAL_LIMIT: usize = 1024 * 1024;

/// Which half of a port-forward this endpoint runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Binds `local_host:local_port` and accepts new connections
    Listening,
    /// Dials `local_host:local_port` on demand
    Dialing,
}

impl TunnelMode {
    pub fn of(config: &TunnelConfig) -> Self {
        if config.reverse {
            TunnelMode::Dialing
        } else {
            TunnelMode::Listening
        }
    }
}

/// Where forwarded payload for a channel ID goes on the dialing half
enum ChannelRoute {
    /// Open channel
    Known(Arc<Channel>),
    /// Queued until the dial in flight completes
    Dialing,
    /// The channel already closed; late payload is dropped
    Closed,
    /// The dial buffer overflowed and the channel was abandoned
    Overflow,
}

/// Payload received for a channel before its dial completed
#[derive(Debug, Default)]
struct PendingDial {
    payloads: Vec<Bytes>,
    buffered: usize,
}

/// Bounded memory of closed channel IDs, oldest forgotten first
#[derive(Debug, Default)]
struct RecentlyClosed {
    order: VecDeque<u32>,
    ids: HashSet<u32>,
}

impl RecentlyClosed {
    fn insert(&mut self, id: u32) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENTLY_CLOSED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A registered port-forward
pub struct Tunnel {
    id: u32,
    config: TunnelConfig,
    mode: TunnelMode,
    channels: ChannelPool,
    outbound: Outbound,
    settings: ChannelSettings,
    registry: &'static ListenRegistry,
    listening: Mutex<Option<(ListenKey, SocketAddr)>>,
    /// Listening UDP half: channel of each datagram peer
    udp_peers: DashMap<SocketAddr, Arc<Channel>>,
    /// Dialing half: dials in flight, keyed by channel ID
    pending_dials: Mutex<HashMap<u32, PendingDial>>,
    recently_closed: Mutex<RecentlyClosed>,
    closed: AtomicBool,
}

impl Tunnel {
    pub fn new(
        config: TunnelConfig,
        outbound: Outbound,
        settings: ChannelSettings,
        registry: &'static ListenRegistry,
    ) -> Self {
        Self {
            id: config.id,
            mode: TunnelMode::of(&config),
            config,
            channels: ChannelPool::new(),
            outbound,
            settings,
            registry,
            listening: Mutex::new(None),
            udp_peers: DashMap::new(),
            pending_dials: Mutex::new(HashMap::new()),
            recently_closed: Mutex::new(RecentlyClosed::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    pub fn channels(&self) -> &ChannelPool {
        &self.channels
    }

    /// Bound address of the listening half
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, addr)| *addr)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Datagram peers with a live channel on the listening UDP half
    pub fn udp_peer_count(&self) -> usize {
        self.udp_peers.len()
    }

    /// Start accepting local connections; a no-op for the dialing half
    pub async fn listen(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.mode == TunnelMode::Dialing {
            return Ok(());
        }

        let requested = ListenKey::new(
            self.config.proto,
            self.config.local_host.clone(),
            self.config.local_port,
        );
        if self.config.local_port != 0 && self.registry.contains(&requested) {
            error!(tunnel = self.id, key = %requested, "Listen address already registered");
            return Err(TunnelError::ListenAddressInUse(requested.to_string()));
        }

        let bind_addr = self.config.local_addr();
        let (addr, task) = match self.config.proto {
            Proto::Tcp => {
                let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
                    error!(tunnel = self.id, addr = %bind_addr, "Listen failed: {}", e);
                    e
                })?;
                let addr = listener.local_addr()?;
                let tunnel = Arc::clone(self);
                (addr, tokio::spawn(async move { tunnel.accept_loop(listener).await }))
            }
            Proto::Udp => {
                let socket = UdpSocket::bind(&bind_addr).await.map_err(|e| {
                    error!(tunnel = self.id, addr = %bind_addr, "Listen failed: {}", e);
                    e
                })?;
                let addr = socket.local_addr()?;
                let tunnel = Arc::clone(self);
                (addr, tokio::spawn(async move { tunnel.datagram_loop(socket).await }))
            }
        };

        let key = ListenKey::new(self.config.proto, self.config.local_host.clone(), addr.port());
        self.registry.register(key.clone(), self.id, addr, task)?;
        *self.listening.lock().unwrap_or_else(|e| e.into_inner()) = Some((key, addr));

        info!(tunnel = self.id, addr = %addr, "Tunnel listening: {}", self.config);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(tunnel = self.id, peer = %peer, "Accept new client");
                    let _ = stream.set_nodelay(true);
                    let id = self.channels.allocate_id();
                    match Channel::tcp(id, self.id, stream, self.outbound.clone(), self.settings) {
                        Ok(channel) => self.start_channel(Arc::new(channel)),
                        Err(e) => warn!(tunnel = self.id, "Create channel failed: {}", e),
                    }
                }
                Err(e) => {
                    error!(tunnel = self.id, "Accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Demultiplex datagrams of the shared socket into one channel per peer
    async fn datagram_loop(self: Arc<Self>, socket: UdpSocket) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; self.settings.read_chunk];

        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    trace!(tunnel = self.id, "UDP recv failed: {}", e);
                    continue;
                }
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            let known = self.udp_peers.get(&peer).map(|entry| Arc::clone(entry.value()));
            if let Some(channel) = known {
                if channel.push_datagram(datagram.clone()) {
                    continue;
                }
                self.forget_udp_peer(&channel);
            }

            let id = self.channels.allocate_id();
            let channel = Arc::new(Channel::udp_peer(
                id,
                self.id,
                Arc::clone(&socket),
                peer,
                self.outbound.clone(),
                self.settings,
            ));
            debug!(tunnel = self.id, channel = id, peer = %peer, "New UDP peer");
            channel.push_datagram(datagram);
            self.udp_peers.insert(peer, Arc::clone(&channel));
            self.start_channel(channel);
        }
    }

    /// Register `channel` and spawn its serving task
    fn start_channel(self: &Arc<Self>, channel: Arc<Channel>) {
        if self.is_closed() {
            channel.close();
            return;
        }
        self.channels.insert(Arc::clone(&channel));
        let tunnel = Arc::clone(self);
        tokio::spawn(async move { tunnel.serve_channel(channel).await });
    }

    async fn serve_channel(&self, channel: Arc<Channel>) {
        if let Err(e) = channel.serve().await {
            debug!(tunnel = self.id, channel = channel.id(), "Channel serve ended: {}", e);
        }
        if !channel.is_closed_by_remote() {
            self.notify_close(channel.id()).await;
        }
        channel.close();
        self.record_closed(channel.id());
        self.channels.remove(&channel);
        self.forget_udp_peer(&channel);
    }

    /// Drop the peer entry of an ended datagram channel
    fn forget_udp_peer(&self, channel: &Arc<Channel>) {
        if self.mode == TunnelMode::Listening && self.config.proto == Proto::Udp {
            self.udp_peers
                .remove_if(&channel.peer_addr(), |_, known| Arc::ptr_eq(known, channel));
        }
    }

    /// Remember a closed channel ID on the dialing half
    fn record_closed(&self, channel_id: u32) {
        if self.mode == TunnelMode::Dialing {
            lock(&self.recently_closed).insert(channel_id);
        }
    }

    /// Tell the peer to close its half of `channel_id`
    async fn notify_close(&self, channel_id: u32) {
        let msg = Tmsg::close(self.id, channel_id);
        if self
            .outbound
            .send_kind(LinkKind::Tunnel, msg.encode())
            .await
            .is_err()
        {
            trace!(tunnel = self.id, channel = channel_id, "Link closed, drop channel close");
        }
    }

    /// Route forwarded payload to its channel, dialing on demand when this is
    /// the dialing half
    ///
    /// Dials run in their own task; payload arriving meanwhile is queued in
    /// order and written once the target is connected.
    pub async fn handle_in(self: &Arc<Self>, msg: Tmsg) -> Result<(), TunnelError> {
        let channel = match self.mode {
            TunnelMode::Listening => match self.channels.get(msg.channel_id) {
                Some(channel) => channel,
                None => {
                    warn!(tunnel = self.id, channel = msg.channel_id, "Can not find channel");
                    return Err(TunnelError::ChannelNotFound {
                        tunnel: self.id,
                        channel: msg.channel_id,
                    });
                }
            },
            TunnelMode::Dialing => match self.route_dialing(msg.channel_id, &msg.payload) {
                ChannelRoute::Known(channel) => channel,
                ChannelRoute::Dialing => return Ok(()),
                ChannelRoute::Closed => {
                    debug!(tunnel = self.id, channel = msg.channel_id, "Drop payload for closed channel");
                    return Ok(());
                }
                ChannelRoute::Overflow => {
                    warn!(tunnel = self.id, channel = msg.channel_id, "Dial buffer full, abandon channel");
                    self.notify_close(msg.channel_id).await;
                    return Err(TunnelError::ChannelClosed);
                }
            },
        };

        if let Err(e) = channel.handle_in(&msg.payload).await {
            error!(tunnel = self.id, channel = channel.id(), "Channel write failed: {}", e);
            channel.close();
            return Err(e);
        }
        Ok(())
    }

    fn route_dialing(self: &Arc<Self>, channel_id: u32, payload: &Bytes) -> ChannelRoute {
        let mut pending = lock(&self.pending_dials);
        if let Some(channel) = self.channels.get(channel_id) {
            return ChannelRoute::Known(channel);
        }
        if let Some(dial) = pending.get_mut(&channel_id) {
            dial.buffered += payload.len();
            if dial.buffered > PENDING_DIAL_LIMIT {
                pending.remove(&channel_id);
                self.record_closed(channel_id);
                return ChannelRoute::Overflow;
            }
            dial.payloads.push(payload.clone());
            return ChannelRoute::Dialing;
        }
        if lock(&self.recently_closed).contains(channel_id) {
            return ChannelRoute::Closed;
        }

        pending.insert(
            channel_id,
            PendingDial {
                payloads: vec![payload.clone()],
                buffered: payload.len(),
            },
        );
        let tunnel = Arc::clone(self);
        tokio::spawn(async move { tunnel.dial_channel(channel_id).await });
        ChannelRoute::Dialing
    }

    /// Dial the target for `channel_id`, flush its queued payload, then
    /// register the channel under the peer's ID
    async fn dial_channel(self: Arc<Self>, channel_id: u32) {
        let channel = match self.connect_target(channel_id).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                debug!(tunnel = self.id, channel = channel_id, "Open channel failed: {}", e);
                self.abandon_dial(channel_id).await;
                return;
            }
        };

        loop {
            let batch = {
                let mut pending = lock(&self.pending_dials);
                let dial = match pending.get_mut(&channel_id) {
                    Some(dial) => dial,
                    None => {
                        trace!(tunnel = self.id, channel = channel_id, "Dial abandoned");
                        channel.close();
                        return;
                    }
                };
                if dial.payloads.is_empty() {
                    pending.remove(&channel_id);
                    self.start_channel(Arc::clone(&channel));
                    debug!(tunnel = self.id, channel = channel_id, "Open channel");
                    return;
                }
                dial.buffered = 0;
                std::mem::take(&mut dial.payloads)
            };

            for payload in batch {
                if let Err(e) = channel.handle_in(&payload).await {
                    error!(tunnel = self.id, channel = channel_id, "Channel write failed: {}", e);
                    channel.close();
                    self.abandon_dial(channel_id).await;
                    return;
                }
            }
        }
    }

    async fn abandon_dial(&self, channel_id: u32) {
        let was_pending = lock(&self.pending_dials).remove(&channel_id).is_some();
        self.record_closed(channel_id);
        if was_pending {
            self.notify_close(channel_id).await;
        }
    }

    async fn connect_target(&self, channel_id: u32) -> Result<Channel, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed);
        }
        let addr = self.config.local_addr();
        match self.config.proto {
            Proto::Tcp => {
                let stream = self.dial(&addr, TcpStream::connect(&addr)).await?;
                let _ = stream.set_nodelay(true);
                Channel::tcp(channel_id, self.id, stream, self.outbound.clone(), self.settings)
            }
            Proto::Udp => {
                let socket = self.dial(&addr, connect_udp(&addr)).await?;
                Channel::udp(channel_id, self.id, socket, self.outbound.clone(), self.settings)
            }
        }
    }

    async fn dial<T>(
        &self,
        addr: &str,
        connect: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T, TunnelError> {
        let outcome = tokio::time::timeout(self.settings.dial_timeout, connect).await;
        let reason = match outcome {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        error!(tunnel = self.id, addr = %addr, "Dial failed: {}", reason);
        Err(TunnelError::Dial {
            addr: addr.to_string(),
            reason,
        })
    }

    /// The peer closed its half of a channel
    pub fn handle_channel_close(&self, msg: &Tmsg) {
        self.record_closed(msg.channel_id);
        match self.channels.get(msg.channel_id) {
            Some(channel) => {
                channel.mark_closed_by_remote();
                channel.close();
                self.channels.remove(&channel);
                self.forget_udp_peer(&channel);
            }
            None if lock(&self.pending_dials).remove(&msg.channel_id).is_some() => {
                debug!(tunnel = self.id, channel = msg.channel_id, "Peer closed channel while dialing");
            }
            None => {
                debug!(tunnel = self.id, channel = msg.channel_id, "Close for unknown channel");
            }
        }
    }

    /// Release the listen address and close every channel; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listening = self
            .listening
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((key, _)) = listening {
            self.registry.release(&key);
        }
        lock(&self.pending_dials).clear();
        self.udp_peers.clear();
        self.channels.close_all();
        debug!(tunnel = self.id, "Close tunnel: {}", self.config);
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// Bind an ephemeral socket of the target's family and connect it
async fn connect_udp(addr: &str) -> std::io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
    })?;
    let local: IpAddr = if target.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind(join_host_port(&local.to_string(), 0)).await?;
    socket.connect(target).await?;
    Ok(socket)
}
