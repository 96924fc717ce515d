//! Channels: one forwarded local connection each
//!
//! A channel owns its local socket. `serve` is the single reader: every
//! non-empty read becomes a `ChannelForward` TMSG on the outbound queue.
//! `handle_in` writes inbound payload to the socket. When `serve` returns the
//! socket is released.

use super::{ChannelSettings, Proto, Tmsg, TunnelError};
use crate::protocol::{LinkKind, Outbound};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Datagrams buffered for a listener-side UDP channel
const DATAGRAM_INBOX: usize = 64;

enum ChannelReader {
    Tcp(OwnedReadHalf),
    /// Connected socket owned by this channel
    Udp(Arc<UdpSocket>),
    /// Datagrams demultiplexed from a shared listening socket
    Datagrams(mpsc::Receiver<Bytes>),
}

enum ChannelWriter {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
    Peer {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

/// One forwarded connection belonging to a tunnel
pub struct Channel {
    id: u32,
    tunnel_id: u32,
    proto: Proto,
    peer: SocketAddr,
    outbound: Outbound,
    settings: ChannelSettings,
    reader: Mutex<Option<ChannelReader>>,
    writer: tokio::sync::Mutex<Option<ChannelWriter>>,
    inbox: Option<mpsc::Sender<Bytes>>,
    closed: AtomicBool,
    closed_by_remote: AtomicBool,
    close_signal: watch::Sender<bool>,
    /// Bytes written to the local socket
    bytes_sent: AtomicU64,
    /// Bytes read from the local socket
    bytes_received: AtomicU64,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    fn with_socket(
        id: u32,
        tunnel_id: u32,
        proto: Proto,
        peer: SocketAddr,
        reader: ChannelReader,
        writer: ChannelWriter,
        inbox: Option<mpsc::Sender<Bytes>>,
        outbound: Outbound,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            id,
            tunnel_id,
            proto,
            peer,
            outbound,
            settings,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            inbox,
            closed: AtomicBool::new(false),
            closed_by_remote: AtomicBool::new(false),
            close_signal: watch::channel(false).0,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Channel over an accepted or dialed TCP stream
    pub fn tcp(
        id: u32,
        tunnel_id: u32,
        stream: TcpStream,
        outbound: Outbound,
        settings: ChannelSettings,
    ) -> Result<Self, TunnelError> {
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self::with_socket(
            id,
            tunnel_id,
            Proto::Tcp,
            peer,
            ChannelReader::Tcp(read),
            ChannelWriter::Tcp(write),
            None,
            outbound,
            settings,
        ))
    }

    /// Channel over a connected UDP socket
    pub fn udp(
        id: u32,
        tunnel_id: u32,
        socket: UdpSocket,
        outbound: Outbound,
        settings: ChannelSettings,
    ) -> Result<Self, TunnelError> {
        let peer = socket.peer_addr()?;
        let socket = Arc::new(socket);
        Ok(Self::with_socket(
            id,
            tunnel_id,
            Proto::Udp,
            peer,
            ChannelReader::Udp(Arc::clone(&socket)),
            ChannelWriter::Udp(socket),
            None,
            outbound,
            settings,
        ))
    }

    /// Channel for one peer of a shared listening UDP socket; datagrams are
    /// fed in with [`push_datagram`](Self::push_datagram)
    pub fn udp_peer(
        id: u32,
        tunnel_id: u32,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        outbound: Outbound,
        settings: ChannelSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(DATAGRAM_INBOX);
        Self::with_socket(
            id,
            tunnel_id,
            Proto::Udp,
            peer,
            ChannelReader::Datagrams(rx),
            ChannelWriter::Peer { socket, peer },
            Some(tx),
            outbound,
            settings,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tunnel_id(&self) -> u32 {
        self.tunnel_id
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    /// Address of the local peer socket
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_closed_by_remote(&self) -> bool {
        self.closed_by_remote.load(Ordering::SeqCst)
    }

    /// The peer already closed its end; no close notice should be echoed
    pub fn mark_closed_by_remote(&self) {
        self.closed_by_remote.store(true, Ordering::SeqCst);
    }

    /// Pump local reads onto the link until EOF, error, idle timeout or close
    pub async fn serve(&self) -> Result<(), TunnelError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TunnelError::ChannelClosed)?;
        let mut closing = self.close_signal.subscribe();

        let result = match reader {
            ChannelReader::Tcp(read) => self.pump_stream(read, &mut closing).await,
            ChannelReader::Udp(socket) => self.pump_socket(&socket, &mut closing).await,
            ChannelReader::Datagrams(inbox) => self.pump_datagrams(inbox, &mut closing).await,
        };

        self.writer.lock().await.take();
        result
    }

    async fn pump_stream(
        &self,
        mut read: OwnedReadHalf,
        closing: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let mut buf = vec![0u8; self.settings.read_chunk];
        loop {
            let n = tokio::select! {
                _ = closing.wait_for(|closed| *closed) => return Ok(()),
                res = read.read(&mut buf) => res?,
            };
            if n == 0 {
                trace!(tunnel = self.tunnel_id, channel = self.id, "Local EOF");
                return Ok(());
            }
            self.forward(&buf[..n]).await?;
        }
    }

    async fn pump_socket(
        &self,
        socket: &UdpSocket,
        closing: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let idle = self.settings.udp_idle_timeout;
        let mut buf = vec![0u8; self.settings.read_chunk];
        loop {
            let res = tokio::select! {
                _ = closing.wait_for(|closed| *closed) => return Ok(()),
                res = tokio::time::timeout(idle, socket.recv(&mut buf)) => res,
            };
            let n = res.map_err(|_| TunnelError::IdleTimeout(idle))??;
            if n > 0 {
                self.forward(&buf[..n]).await?;
            }
        }
    }

    async fn pump_datagrams(
        &self,
        mut inbox: mpsc::Receiver<Bytes>,
        closing: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let idle = self.settings.udp_idle_timeout;
        loop {
            let next = tokio::select! {
                _ = closing.wait_for(|closed| *closed) => return Ok(()),
                next = tokio::time::timeout(idle, inbox.recv()) => next,
            };
            match next.map_err(|_| TunnelError::IdleTimeout(idle))? {
                Some(datagram) if !datagram.is_empty() => self.forward(&datagram).await?,
                Some(_) => {}
                None => return Ok(()),
            }
        }
    }

    async fn forward(&self, data: &[u8]) -> Result<(), TunnelError> {
        let msg = Tmsg::forward(self.tunnel_id, self.id, Bytes::copy_from_slice(data));
        self.outbound
            .send_kind(LinkKind::Tunnel, msg.encode())
            .await
            .map_err(|_| TunnelError::LinkClosed)?;
        self.bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Feed a datagram received on the shared listening socket; returns
    /// false once the channel is gone. A full inbox drops the datagram.
    pub fn push_datagram(&self, datagram: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match &self.inbox {
            Some(inbox) => match inbox.try_send(datagram) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(tunnel = self.tunnel_id, channel = self.id, "Inbox full, drop datagram");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Write inbound payload to the local socket; a short write is an error
    pub async fn handle_in(&self, payload: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TunnelError::ChannelClosed)?;

        let written = match writer {
            ChannelWriter::Tcp(write) => {
                write.write_all(payload).await?;
                payload.len()
            }
            ChannelWriter::Udp(socket) => socket.send(payload).await?,
            ChannelWriter::Peer { socket, peer } => socket.send_to(payload, *peer).await?,
        };
        if written != payload.len() {
            return Err(TunnelError::ShortWrite {
                written,
                expected: payload.len(),
            });
        }

        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close the channel; only the first call has any effect
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.send_replace(true);
        debug!(
            tunnel = self.tunnel_id,
            channel = self.id,
            proto = %self.proto,
            peer = %self.peer,
            recv = self.bytes_received(),
            send = self.bytes_sent(),
            "Close channel"
        );
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("tunnel_id", &self.tunnel_id)
            .field("proto", &self.proto)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Channels of one tunnel keyed by ID
#[derive(Debug)]
pub struct ChannelPool {
    next_id: AtomicU32,
    channels: DashMap<u32, Arc<Channel>>,
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPool {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            channels: DashMap::new(),
        }
    }

    /// Next unused channel ID
    pub fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a channel under its own ID, returning any channel it replaced
    pub fn insert(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels.insert(channel.id(), channel)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.contains_key(&id)
    }

    /// Remove `channel` if it is still the one registered under its ID
    pub fn remove(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .remove_if(&channel.id(), |_, current| Arc::ptr_eq(current, channel))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove and close every channel
    pub fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in channels {
            self.remove(&channel);
            channel.close();
        }
    }
}
