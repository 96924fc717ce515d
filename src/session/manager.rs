//! Session manager: request/response correlation over the shared link

use super::{
    Emsg, EmsgType, EMSG_HEADER_SIZE, Request, Response, Router, Session, SessionError, SessionPool,
    STATUS_BAD_REQUEST, STATUS_BAD_RESPONSE, STATUS_DISPATCH_FAILED,
};
use crate::protocol::{LinkKind, Outbound, MAX_LINK_MESSAGE_SIZE};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Correlates requests with responses and serves inbound requests
pub struct SessionManager {
    pool: Arc<SessionPool>,
    outbound: Outbound,
    router: Router,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new(
        is_server_side: bool,
        outbound: Outbound,
        router: Router,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pool: Arc::new(SessionPool::new(is_server_side)),
            outbound,
            router,
            request_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a new session with the next ID of this endpoint's parity
    pub fn new_session(&self) -> Result<Session, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::LinkClosed);
        }
        Session::open(
            Arc::clone(&self.pool),
            self.outbound.clone(),
            self.request_timeout,
        )
    }

    /// Open a session, send `request` and wait for the response
    pub async fn request(&self, request: Request) -> Result<Response, SessionError> {
        let mut session = self.new_session()?;
        session.send_and_wait(request).await
    }

    /// Same as [`request`](Self::request) with an explicit bound
    pub async fn request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let mut session = self.new_session()?;
        session.send_and_wait_timeout(request, timeout).await
    }

    /// Handle the body of an inbound `Session` link message
    pub async fn handle_in(&self, payload: Bytes) -> Result<(), SessionError> {
        let msg = Emsg::decode(payload)?;

        match msg.msg_type {
            EmsgType::Request => {
                let response = self.handle_request(msg).await;
                if self
                    .outbound
                    .send_kind(LinkKind::Session, response.encode())
                    .await
                    .is_err()
                {
                    debug!(session = response.id, "Link closed, dropping response");
                }
                Ok(())
            }
            EmsgType::Response => self.pool.deliver(msg.id, msg.payload).map_err(|e| {
                warn!(session = msg.id, "Can not find session for response");
                e
            }),
        }
    }

    async fn handle_request(&self, msg: Emsg) -> Emsg {
        let response = match serde_json::from_slice::<Request>(&msg.payload) {
            Ok(request) => {
                let action = request.action.clone();
                match self.router.dispatch(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!(session = msg.id, action = %action, "Dispatch request failed: {}", e);
                        Response::status(STATUS_DISPATCH_FAILED)
                    }
                }
            }
            Err(e) => {
                error!(session = msg.id, "Unmarshal session request failed: {}", e);
                Response::status(STATUS_BAD_REQUEST)
            }
        };

        let bad_response =
            || serde_json::to_vec(&Response::status(STATUS_BAD_RESPONSE)).unwrap_or_default();
        let mut payload = serde_json::to_vec(&response).unwrap_or_else(|e| {
            error!(session = msg.id, "Marshal response failed: {}", e);
            bad_response()
        });
        let size = 1 + EMSG_HEADER_SIZE + payload.len();
        if size > MAX_LINK_MESSAGE_SIZE {
            error!(session = msg.id, size, "Response exceeds the link message limit");
            payload = bad_response();
        }

        Emsg::response(msg.id, Bytes::from(payload))
    }

    /// Number of sessions waiting for a response
    pub fn pending(&self) -> usize {
        self.pool.len()
    }

    /// Release every outstanding session; waiters see [`SessionError::LinkClosed`]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close();
    }
}
