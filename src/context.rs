//! Per-request handler context: the one thing a [`crate::handler::Handler`]
//! is given to call back into its connection.
//!
//! A handler subtask is spawned with `tokio::spawn` and so needs `'static`
//! ownership rather than a borrow of the connection; `HandlerContext` holds a
//! cheap `Arc` clone of the connection's shared state instead.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::codec::Payload;
use crate::connection::ConnectionInner;
use crate::error::{CatsError, Result};
use crate::headers::Headers;
use crate::protocol::Action;

pub struct HandlerContext {
    pub(crate) inner: Arc<ConnectionInner>,
    /// The inbound request this context was created for.
    pub action: Action,
    /// The request body, already codec-decoded.
    pub payload: Payload,
    pub(crate) handler_id: u16,
    pub(crate) message_id: u16,
    /// Shared across every `ask()` issued while handling this single
    /// request, so the limit is per-request, not per-call.
    pub(crate) ask_count: Arc<AtomicU32>,
    pub(crate) bypass_count: AtomicBool,
}

impl HandlerContext {
    pub fn headers(&self) -> &Headers {
        match &self.action {
            Action::Action { headers, .. } => headers,
            Action::StreamAction { headers, .. } => headers,
            _ => panic!("handler context built from a non-request action"),
        }
    }

    pub fn handler_id(&self) -> u16 {
        self.handler_id
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// `api_version` the peer declared in its statement.
    pub fn api_version(&self) -> u32 {
        self.inner.peer_api_version()
    }

    /// Estimated clock offset (peer minus local).
    pub fn clock_offset(&self) -> i64 {
        self.inner.clock_offset()
    }

    /// Exempt this request's remaining `ask()` calls from the input-chain
    /// limit.
    pub fn set_bypass_count(&self, bypass: bool) {
        self.bypass_count.store(bypass, Ordering::SeqCst);
    }

    /// Suspend this request's handling, asking the peer for more input and
    /// waiting for its `InputAction` reply (or cancellation, or timeout).
    pub async fn ask(&self, payload: Payload, headers: Headers) -> Result<Action> {
        if !self.bypass_count.load(Ordering::SeqCst) {
            let count = self.ask_count.fetch_add(1, Ordering::SeqCst) + 1;
            let limit = self.inner.config().input_limit;
            if count > limit {
                return Err(CatsError::InputLimitExceeded { limit });
            }
        }
        self.inner.ask_payload(self.message_id, payload, headers).await
    }

    /// Send a reply/request that does not participate in this context's
    /// own request/reply slot (e.g. a broadcast or an unsolicited push).
    pub async fn send(&self, action: Action) -> Result<()> {
        self.inner.send_raw(&action).await
    }
}
