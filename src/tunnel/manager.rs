//! Tunnel manager: the tunnels of one link

use super::{
    ChannelSettings, ListenRegistry, Tmsg, TmsgType, Tunnel, TunnelConfig, TunnelError,
};
use crate::protocol::Outbound;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Upper bound on tunnels of one parity
const TUNNEL_ID_SPACE: usize = (u32::MAX / 2) as usize;

/// Owns the tunnels of one link and routes TMSGs to them
pub struct TunnelManager {
    cur_id: Mutex<u32>,
    tunnels: DashMap<u32, Arc<Tunnel>>,
    outbound: Outbound,
    settings: ChannelSettings,
    registry: &'static ListenRegistry,
    closed: AtomicBool,
}

impl TunnelManager {
    pub fn new(is_server_side: bool, outbound: Outbound, settings: ChannelSettings) -> Self {
        Self {
            cur_id: Mutex::new(if is_server_side { 1 } else { 2 }),
            tunnels: DashMap::new(),
            outbound,
            settings,
            registry: ListenRegistry::global(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a tunnel and start listening if it is the listening half
    ///
    /// A zero `cfg.id` gets the next ID of this endpoint's parity; a non-zero
    /// one is used as given and must be free.
    pub async fn tunnel_create(&self, cfg: TunnelConfig) -> Result<Arc<Tunnel>, TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::ManagerClosed);
        }
        debug!("Prepare to create a tunnel with config {:?}", cfg);

        let tunnel = self.register(cfg)?;
        if let Err(e) = tunnel.listen().await {
            error!(tunnel = tunnel.id(), "Run tunnel {} failed: {}", tunnel.config(), e);
            self.tunnels.remove(&tunnel.id());
            tunnel.close();
            return Err(e);
        }

        // Lost a race with close()
        if self.closed.load(Ordering::SeqCst) {
            self.tunnels.remove(&tunnel.id());
            tunnel.close();
            return Err(TunnelError::ManagerClosed);
        }

        debug!(tunnel = tunnel.id(), "Create tunnel: {}", tunnel.config());
        Ok(tunnel)
    }

    fn register(&self, mut cfg: TunnelConfig) -> Result<Arc<Tunnel>, TunnelError> {
        if cfg.id != 0 {
            return match self.tunnels.entry(cfg.id) {
                Entry::Occupied(_) => {
                    error!(tunnel = cfg.id, "Create tunnel by ID failed: ID in use");
                    Err(TunnelError::IdInUse(cfg.id))
                }
                Entry::Vacant(entry) => {
                    let tunnel = Arc::new(self.build(cfg));
                    entry.insert(Arc::clone(&tunnel));
                    Ok(tunnel)
                }
            };
        }

        if self.tunnels.len() >= TUNNEL_ID_SPACE {
            return Err(TunnelError::IdExhausted);
        }
        let mut cur = self.cur_id.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            *cur = cur.wrapping_add(2);
            if *cur == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.tunnels.entry(*cur) {
                cfg.id = *cur;
                let tunnel = Arc::new(self.build(cfg));
                entry.insert(Arc::clone(&tunnel));
                return Ok(tunnel);
            }
        }
    }

    fn build(&self, cfg: TunnelConfig) -> Tunnel {
        Tunnel::new(cfg, self.outbound.clone(), self.settings, self.registry)
    }

    /// Handle the body of an inbound `Tunnel` link message
    pub async fn handle_in(&self, payload: Bytes) -> Result<(), TunnelError> {
        let msg = Tmsg::decode(payload)?;
        let tunnel = self.get(msg.tunnel_id).ok_or_else(|| {
            warn!(tunnel = msg.tunnel_id, "Can not find tunnel");
            TunnelError::NotFound(msg.tunnel_id)
        })?;

        match msg.msg_type {
            TmsgType::ChannelForward => tunnel.handle_in(msg).await,
            TmsgType::ChannelClose => {
                tunnel.handle_channel_close(&msg);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Tunnel>> {
        self.tunnels.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Close every tunnel of this link, releasing their listen addresses
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u32> = self.tunnels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tunnel)) = self.tunnels.remove(&id) {
                tunnel.close();
            }
        }
        debug!("Tunnel manager closed");
    }
}
