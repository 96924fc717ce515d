//! Session pool and the caller-side session handle

use super::{Emsg, Request, Response, SessionError};
use crate::protocol::{LinkKind, LinkMessage, Outbound, MAX_LINK_MESSAGE_SIZE};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Upper bound on simultaneously pending sessions of one parity
const SESSION_ID_SPACE: usize = (u32::MAX / 2) as usize;

/// Pending sessions keyed by correlation ID
///
/// IDs advance by two from a parity base (1 for the server side, 2 for the
/// client side) so the two endpoints of a link never hand out the same ID.
#[derive(Debug)]
pub struct SessionPool {
    cur_id: Mutex<u32>,
    slots: DashMap<u32, oneshot::Sender<Bytes>>,
}

impl SessionPool {
    pub fn new(is_server_side: bool) -> Self {
        Self {
            cur_id: Mutex::new(if is_server_side { 1 } else { 2 }),
            slots: DashMap::new(),
        }
    }

    /// Allocate the next free ID and register its delivery slot
    fn allocate(&self) -> Result<(u32, oneshot::Receiver<Bytes>), SessionError> {
        if self.slots.len() >= SESSION_ID_SPACE {
            return Err(SessionError::IdExhausted);
        }

        let mut cur = self.cur_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = loop {
            *cur = cur.wrapping_add(2);
            if *cur == 0 {
                continue;
            }
            if !self.slots.contains_key(&*cur) {
                break *cur;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        Ok((id, rx))
    }

    /// Fill the delivery slot of `id`; the slot is reclaimed either way
    pub fn deliver(&self, id: u32, payload: Bytes) -> Result<(), SessionError> {
        let (_, tx) = self.slots.remove(&id).ok_or(SessionError::NotFound(id))?;
        if tx.send(payload).is_err() {
            trace!(session = id, "Response arrived after the caller gave up");
        }
        Ok(())
    }

    pub fn remove(&self, id: u32) {
        self.slots.remove(&id);
    }

    /// Remove the slot of `id` only if its receiver is gone, so an ID that was
    /// already reallocated to a newer session is left alone
    fn remove_abandoned(&self, id: u32) {
        self.slots.remove_if(&id, |_, tx| tx.is_closed());
    }

    pub fn contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Release every pending slot, waking all waiters with a closed error
    pub fn close(&self) {
        let ids: Vec<u32> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if self.slots.remove(&id).is_some() {
                debug!(session = id, "Close session");
            }
        }
    }
}

/// One correlated request/response exchange
///
/// The handle is single use: the first `send_and_wait` consumes its
/// delivery slot. Dropping a handle that is still pending frees the slot.
#[derive(Debug)]
pub struct Session {
    id: u32,
    reply: Option<oneshot::Receiver<Bytes>>,
    outbound: Outbound,
    pool: Arc<SessionPool>,
    default_timeout: Duration,
}

impl Session {
    pub(crate) fn open(
        pool: Arc<SessionPool>,
        outbound: Outbound,
        default_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let (id, reply) = pool.allocate()?;
        Ok(Self {
            id,
            reply: Some(reply),
            outbound,
            pool,
            default_timeout,
        })
    }

    /// Correlation ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send a request and wait for its response, bounded by the default timeout
    pub async fn send_and_wait(&mut self, request: Request) -> Result<Response, SessionError> {
        self.send_and_wait_timeout(request, self.default_timeout).await
    }

    /// Send a request and wait at most `timeout` for its response
    pub async fn send_and_wait_timeout(
        &mut self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let reply = self.reply.take().ok_or(SessionError::Consumed(self.id))?;

        let payload = serde_json::to_vec(&request)?;
        let msg = LinkMessage::new(
            LinkKind::Session,
            Emsg::request(self.id, Bytes::from(payload)).encode(),
        );
        if msg.encoded_len() > MAX_LINK_MESSAGE_SIZE {
            drop(reply);
            self.pool.remove(self.id);
            return Err(SessionError::MessageTooLarge {
                size: msg.encoded_len(),
                max: MAX_LINK_MESSAGE_SIZE,
            });
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::LinkClosed)?;

        let outcome = tokio::time::timeout(timeout, reply).await;
        let data = match outcome {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => return Err(SessionError::LinkClosed),
            Err(_) => {
                self.pool.remove_abandoned(self.id);
                return Err(SessionError::Timeout(self.id));
            }
        };

        Ok(serde_json::from_slice(&data)?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.reply.take());
        self.pool.remove_abandoned(self.id);
    }
}
