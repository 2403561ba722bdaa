//! Connection state machine: version exchange, statement exchange, optional
//! handshake, then the `RUNNING` dispatch + ping loops.
//!
//! A handshake phase, then a spawned reader loop and a spawned heartbeat
//! loop sharing a writer behind a lock.

pub mod mux;
pub mod scheduler;

mod dispatch;
mod init;
mod ping;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastRegistry, Subscription};
use crate::codec::Payload;
use crate::compress::Compressor;
use crate::config::EngineConfig;
use crate::error::{CatsError, ClosedReason, Result};
use crate::handler::HandlerRegistry;
use crate::handshake::Handshake;
use crate::headers::Headers;
use crate::protocol::action::{ActionHead, InputActionHead};
use crate::protocol::Action;
use crate::scheme_format::SchemeFormat;

use mux::{InputResolution, Multiplexer};
use scheduler::SendScheduler;

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// State shared between the dispatch loop, the ping loop, and every
/// outstanding `HandlerContext`. Never exposed directly; reached through
/// [`Connection`] or [`crate::context::HandlerContext`].
pub struct ConnectionInner {
    mux: Mutex<Multiplexer>,
    scheduler: SendScheduler<BoxedWriter>,
    registry: Arc<dyn HandlerRegistry>,
    config: Arc<EngineConfig>,
    role: Role,
    peer_api_version: u32,
    peer_scheme_format: SchemeFormat,
    peer_compressors: Vec<Compressor>,
    peer_default_compression: Option<Compressor>,
    clock_offset: i64,
    last_activity_millis: AtomicU64,
    closed: AtomicBool,
    broadcast: Arc<BroadcastRegistry>,
    /// Channels this connection has subscribed to via
    /// [`Connection::subscribe_broadcast`], so `close()` can unsubscribe them.
    subscriptions: Mutex<Vec<(String, u64)>>,
}

impl ConnectionInner {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn peer_api_version(&self) -> u32 {
        self.peer_api_version
    }

    pub(crate) fn clock_offset(&self) -> i64 {
        self.clock_offset
    }

    pub(crate) fn registry(&self) -> &Arc<dyn HandlerRegistry> {
        &self.registry
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        self.last_activity_millis.store(monotonic_millis(), Ordering::Relaxed);
    }

    pub(crate) fn millis_since_activity(&self) -> u64 {
        monotonic_millis().saturating_sub(self.last_activity_millis.load(Ordering::Relaxed))
    }

    pub(crate) async fn send_raw(&self, action: &Action) -> Result<()> {
        if self.is_closed() {
            return Err(CatsError::ConnectionClosed(ClosedReason::Shutdown));
        }
        self.scheduler.send(action).await
    }

    fn now_adjusted(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        (now + self.clock_offset).max(0) as u64
    }

    fn encode_for_peer(&self, payload: &Payload, headers: Headers, offset: Option<u64>) -> Result<crate::pipeline::EncodedAction> {
        // `propose()` picks from the peer's supported compressors using the
        // size/already-compressed heuristic; `peer_default_compression`
        // isn't forced here, it's only a hint a future explicit-compressor
        // API could honor.
        crate::pipeline::encode(payload, self.peer_scheme_format, headers, offset, None, &self.peer_compressors)
    }

    /// Send a new request and wait for its matching reply.
    pub(crate) async fn request(&self, handler_id: u16, payload: Payload, headers: Headers) -> Result<Action> {
        let encoded = self.encode_for_peer(&payload, headers, None)?;

        let (message_id, rx) = {
            let mut mux = self.mux.lock().await;
            let message_id = mux.allocate_message_id()?;
            let (tx, rx) = oneshot::channel();
            mux.register_reply_waiter(message_id, tx)?;
            (message_id, rx)
        };

        let head = ActionHead {
            handler_id,
            message_id,
            send_time: self.now_adjusted(),
            data_type: encoded.data_type as u8,
            compressor: encoded.compressor.id(),
            data_len: 0,
        };
        let action = Action::Action { head, headers: encoded.headers, payload: encoded.payload };
        self.send_raw(&action).await?;

        self.await_oneshot(rx, self.config.input_timeout()).await
    }

    /// Issue an `ask()` against an in-flight request's `message_id` and wait
    /// for the peer's `InputAction` reply, cancellation, or timeout.
    pub(crate) async fn ask_payload(&self, message_id: u16, payload: Payload, headers: Headers) -> Result<Action> {
        let encoded = self.encode_for_peer(&payload, headers, None)?;

        let rx = {
            let mut mux = self.mux.lock().await;
            let (tx, rx) = oneshot::channel();
            mux.register_pending_input(message_id, tx);
            rx
        };

        let head = InputActionHead {
            message_id,
            data_type: encoded.data_type as u8,
            compressor: encoded.compressor.id(),
            data_len: 0,
        };
        let action = Action::InputAction { head, headers: encoded.headers, payload: encoded.payload };
        self.send_raw(&action).await?;

        let timeout = self.config.input_timeout();
        let resolution = match timeout {
            Some(d) => tokio::time::timeout(d, rx).await.map_err(|_| CatsError::InputTimeout(d))?,
            None => rx.await,
        };
        match resolution.map_err(|_| CatsError::ConnectionClosed(ClosedReason::PeerClosed))? {
            InputResolution::Reply(action) => Ok(action),
            InputResolution::Cancelled => Err(CatsError::InputCancelled),
        }
    }

    async fn await_oneshot(&self, rx: oneshot::Receiver<Action>, timeout: Option<std::time::Duration>) -> Result<Action> {
        match timeout {
            Some(d) => tokio::time::timeout(d, rx).await.map_err(|_| CatsError::InputTimeout(d))?,
            None => rx.await,
        }
        .map_err(|_| CatsError::ConnectionClosed(ClosedReason::PeerClosed))
    }
}

fn monotonic_millis() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<tokio::time::Instant> = OnceLock::new();
    let start = *START.get_or_init(tokio::time::Instant::now);
    tokio::time::Instant::now().saturating_duration_since(start).as_millis() as u64
}

/// A running CATS connection: the public handle an embedder holds. Dropping
/// it aborts the background dispatch/ping tasks.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    dispatch: JoinHandle<()>,
    ping: Option<JoinHandle<()>>,
}

impl Connection {
    /// Run the client side of a fresh transport: version + statement
    /// exchange, optional handshake, then start `RUNNING`.
    pub async fn connect<T>(
        transport: T,
        config: EngineConfig,
        registry: Arc<dyn HandlerRegistry>,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self>
    where
        T: tokio::io::AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        init::open(Role::Client, transport, config, registry, handshake).await
    }

    /// Run the server side of a freshly accepted transport.
    pub async fn accept<T>(
        transport: T,
        config: EngineConfig,
        registry: Arc<dyn HandlerRegistry>,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self>
    where
        T: tokio::io::AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        init::open(Role::Server, transport, config, registry, handshake).await
    }

    /// Issue a request and wait for its reply.
    pub async fn request(&self, handler_id: u16, payload: Payload, headers: Headers) -> Result<Action> {
        self.inner.request(handler_id, payload, headers).await
    }

    /// Send an action with no reply correlation (e.g. a pre-built broadcast).
    pub async fn send(&self, action: Action) -> Result<()> {
        self.inner.send_raw(&action).await
    }

    /// Ask the peer to cap the rate it sends *to us*. This only updates the
    /// peer's scheduler (applied when the `DownloadSpeedAction` arrives on
    /// their side, see `dispatch::handle_inbound`); it has no effect on what
    /// this side sends.
    pub async fn set_download_speed(&self, bytes_per_sec: u64) -> Result<()> {
        self.inner.send_raw(&Action::DownloadSpeed { speed: bytes_per_sec.min(u32::MAX as u64) as u32 }).await
    }

    /// Subscribe this connection to a named broadcast channel on the
    /// process-wide [`BroadcastRegistry`]. The returned [`Subscription`]'s
    /// `rx` yields every action later published to `channel`; `close()`
    /// unsubscribes it automatically.
    pub async fn subscribe_broadcast(&self, channel: impl Into<String>) -> Subscription {
        let sub = self.inner.broadcast.subscribe(channel).await;
        self.inner.subscriptions.lock().await.push((sub.channel().to_string(), sub.id()));
        sub
    }

    /// Gracefully close the connection, cancelling every in-flight waiter and
    /// unsubscribing every broadcast channel this connection joined.
    pub async fn close(&self) {
        self.inner.mark_closed();
        self.mux().await.cancel_all();
        for (channel, id) in self.inner.subscriptions.lock().await.drain(..) {
            self.inner.broadcast.unsubscribe_by_id(&channel, id).await;
        }
        self.dispatch.abort();
        if let Some(ping) = &self.ping {
            ping.abort();
        }
    }

    async fn mux(&self) -> tokio::sync::MutexGuard<'_, Multiplexer> {
        self.inner.mux.lock().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispatch.abort();
        if let Some(ping) = &self.ping {
            ping.abort();
        }
    }
}
