//! Process-wide registry of tunnel listen addresses
//!
//! Every listening tunnel in the process, across all links, registers its
//! `(proto, host, port)` here, so one address is never owned by two tunnels.

use super::{Proto, TunnelError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::task::JoinHandle;
use tracing::debug;

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub proto: Proto,
    pub host: String,
    pub port: u16,
}

impl ListenKey {
    pub fn new(proto: Proto, host: impl Into<String>, port: u16) -> Self {
        Self {
            proto,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ListenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.proto, self.host, self.port)
    }
}

/// An active listener and the task serving it
#[derive(Debug)]
struct ListenTarget {
    tunnel_id: u32,
    addr: SocketAddr,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl ListenTarget {
    /// Stop the serving task; the socket is released with it
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        debug!(tunnel = self.tunnel_id, addr = %self.addr, "Close listener");
    }
}

/// Listeners keyed by `(proto, host, port)`
#[derive(Debug, Default)]
pub struct ListenRegistry {
    targets: DashMap<ListenKey, ListenTarget>,
}

static GLOBAL: OnceLock<ListenRegistry> = OnceLock::new();

impl ListenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every tunnel manager in the process
    pub fn global() -> &'static ListenRegistry {
        GLOBAL.get_or_init(ListenRegistry::new)
    }

    pub fn contains(&self, key: &ListenKey) -> bool {
        self.targets.contains_key(key)
    }

    /// Record `task` as serving `key`; on conflict the task is aborted
    pub(crate) fn register(
        &self,
        key: ListenKey,
        tunnel_id: u32,
        addr: SocketAddr,
        task: JoinHandle<()>,
    ) -> Result<(), TunnelError> {
        match self.targets.entry(key) {
            Entry::Occupied(entry) => {
                task.abort();
                Err(TunnelError::ListenAddressInUse(entry.key().to_string()))
            }
            Entry::Vacant(entry) => {
                debug!(tunnel = tunnel_id, key = %entry.key(), "Register listener");
                entry.insert(ListenTarget {
                    tunnel_id,
                    addr,
                    task,
                    closed: AtomicBool::new(false),
                });
                Ok(())
            }
        }
    }

    /// Remove and close the listener for `key`, returning whether one existed
    pub fn release(&self, key: &ListenKey) -> bool {
        match self.targets.remove(key) {
            Some((_, target)) => {
                target.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
