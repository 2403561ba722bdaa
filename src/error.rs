//! Crate-wide error taxonomy.
//!
//! Mirrors the engine's error kinds from the protocol design: framing/IO
//! failures are fatal to the connection, exchange-scoped failures
//! (`InputLimitExceeded`, `InputTimeout`, `InputCancelled`) only fail the
//! in-flight handler.

use std::io;

/// Top-level error type returned by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum CatsError {
    /// Malformed framing, unknown action id, out-of-range message id, or an
    /// input reply with no pending waiter. Always fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake rejected or timed out. Fatal; connection is closed after
    /// writing the reject byte.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Handler-level input validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// A request's `ask` chain exceeded the configured `input_limit`.
    #[error("input chain limit exceeded (limit = {limit})")]
    InputLimitExceeded { limit: u32 },

    /// An `ask` call was not answered within `input_timeout`.
    #[error("input timed out after {0:?}")]
    InputTimeout(std::time::Duration),

    /// An `ask` call was resolved by a peer `CancelInputAction`.
    #[error("input was cancelled by peer")]
    InputCancelled,

    /// Any operation suspended on a connection that has since closed.
    #[error("connection closed: {0:?}")]
    ConnectionClosed(ClosedReason),

    /// Underlying transport I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl CatsError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for the error kinds that must tear down the whole connection
    /// rather than just failing one in-flight exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Handshake(_) | Self::Transport(_) | Self::ConnectionClosed(_)
        )
    }
}

/// Why a connection transitioned to `CLOSED`. Attached to
/// [`CatsError::ConnectionClosed`] so callers can tell graceful shutdown
/// from a protocol failure in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    PeerClosed,
    Idle,
    Protocol,
    Handshake,
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CatsError>;
