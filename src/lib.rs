//! CATS: Cifrazia Action Transport System, a multiplexed request/reply and
//! streaming protocol engine over a reliable byte stream.
//!
//! The crate is transport-agnostic (anything `AsyncRead + AsyncWrite`, not
//! just TCP) and carries no routing policy of its own: an embedder supplies
//! a [`handler::HandlerRegistry`] and drives a [`connection::Connection`]
//! through [`Connection::connect`]/[`Connection::accept`].

pub mod broadcast;
pub mod codec;
pub mod compress;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod headers;
pub mod pipeline;
pub mod protocol;
pub mod scheme_format;
pub mod statement;

pub use broadcast::BroadcastRegistry;
pub use codec::{DataType, Payload};
pub use compress::Compressor;
pub use config::EngineConfig;
pub use connection::{Connection, Role};
pub use context::HandlerContext;
pub use error::{CatsError, ClosedReason, Result};
pub use handler::{Handler, HandlerRegistry, Lookup, NoopRegistry};
pub use handshake::{Handshake, NoHandshake, Sha256Handshake};
pub use headers::Headers;
pub use protocol::{Action, ActionId, FrameReader, FrameWriter};
pub use scheme_format::SchemeFormat;
pub use statement::{ClientStatement, ServerStatement};
