//! Connection bring-up: protocol-version exchange, statement exchange with
//! format auto-detection, and the optional pluggable handshake.
//!
//! Runs a fixed negotiation sequence before handing the transport off to the
//! reader/writer loops.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compress::Compressor;
use crate::config::EngineConfig;
use crate::error::{CatsError, Result};
use crate::handler::HandlerRegistry;
use crate::handshake::Handshake;
use crate::protocol::FrameReader;
use crate::scheme_format::SchemeFormat;
use crate::statement::{self, ClientStatement, ServerStatement};

use super::mux::Multiplexer;
use super::scheduler::SendScheduler;
use super::{BoxedWriter, Connection, ConnectionInner, Role};

struct Negotiated {
    peer_api_version: u32,
    peer_scheme_format: SchemeFormat,
    peer_compressors: Vec<Compressor>,
    peer_default_compression: Option<Compressor>,
    clock_offset: i64,
}

pub(crate) async fn open<T>(
    role: Role,
    transport: T,
    config: EngineConfig,
    registry: Arc<dyn HandlerRegistry>,
    handshake: Arc<dyn Handshake>,
) -> Result<Connection>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::new(config);
    let (mut read_half, mut write_half) = tokio::io::split(transport);

    let negotiated = match config.handshake_timeout() {
        Some(d) => tokio::time::timeout(d, negotiate(role, &mut read_half, &mut write_half, &config, &handshake))
            .await
            .map_err(|_| CatsError::handshake("setup timed out"))??,
        None => negotiate(role, &mut read_half, &mut write_half, &config, &handshake).await?,
    };

    let boxed_write: BoxedWriter = Box::new(write_half);
    let writer = crate::protocol::FrameWriter::new(negotiated.peer_scheme_format);
    let scheduler = SendScheduler::new(boxed_write, writer, config.download_speed);
    let frame_reader = FrameReader::new(config.spill_threshold_bytes, negotiated.peer_scheme_format);

    let inner = Arc::new(ConnectionInner {
        mux: tokio::sync::Mutex::new(Multiplexer::new()),
        scheduler,
        registry,
        config: config.clone(),
        role,
        peer_api_version: negotiated.peer_api_version,
        peer_scheme_format: negotiated.peer_scheme_format,
        peer_compressors: negotiated.peer_compressors,
        peer_default_compression: negotiated.peer_default_compression,
        clock_offset: negotiated.clock_offset,
        last_activity_millis: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        broadcast: crate::broadcast::global(),
        subscriptions: tokio::sync::Mutex::new(Vec::new()),
    });
    inner.touch();

    let dispatch = tokio::spawn(super::dispatch::run(inner.clone(), read_half, frame_reader));
    let ping = match role {
        Role::Server => Some(tokio::spawn(super::ping::run(inner.clone()))),
        Role::Client => None,
    };

    Ok(Connection { inner, dispatch, ping })
}

async fn negotiate<R, W>(
    role: Role,
    read: &mut R,
    write: &mut W,
    config: &EngineConfig,
    handshake: &Arc<dyn Handshake>,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Protocol-version exchange: the client writes its version; the server
    // reads it, compares against what it supports, and writes 0x00000000 on
    // acceptance or its own preferred version on mismatch before closing.
    let peer_api_version = match role {
        Role::Client => {
            write.write_u32(config.api_version).await?;
            let ack = read.read_u32().await?;
            if ack != 0 {
                return Err(CatsError::protocol(format!(
                    "server rejected protocol version {}; server prefers {ack}",
                    config.api_version
                )));
            }
            config.api_version
        }
        Role::Server => {
            let client_version = read.read_u32().await?;
            if client_version == config.api_version {
                write.write_u32(0).await?;
            } else {
                write.write_u32(config.api_version).await?;
                return Err(CatsError::protocol(format!(
                    "unsupported client protocol version {client_version}, server supports {}",
                    config.api_version
                )));
            }
            client_version
        }
    };

    let (peer_scheme_format, peer_compressors, peer_default_compression, clock_offset) = match role {
        Role::Client => {
            let client_time = now_millis();
            let stmt = ClientStatement::new(config.api_version, client_time, config.scheme_format, config.supported_compressors())?;
            let bytes = config.scheme_format.encode(&stmt)?;
            write.write_u32(bytes.len() as u32).await?;
            write.write_all(&bytes).await?;

            let len = read.read_u32().await? as usize;
            let mut buf = vec![0u8; len];
            read.read_exact(&mut buf).await?;
            let format = SchemeFormat::detect(&buf);
            let server_stmt: ServerStatement = format.decode(&buf)?;

            let offset = statement::clock_offset(server_stmt.server_time, client_time);
            (config.scheme_format, config.supported_compressors(), None, offset)
        }
        Role::Server => {
            let len = read.read_u32().await? as usize;
            let mut buf = vec![0u8; len];
            read.read_exact(&mut buf).await?;
            let format = SchemeFormat::detect(&buf);
            let client_stmt: ClientStatement = format.decode(&buf)?;
            client_stmt.validate()?;

            let server_time = now_millis();
            let server_stmt = ServerStatement::new(server_time);
            let bytes = format.encode(&server_stmt)?;
            write.write_u32(bytes.len() as u32).await?;
            write.write_all(&bytes).await?;

            let offset = statement::clock_offset(server_time, client_stmt.client_time);
            let compressors = client_stmt.compressor_ids()?;
            let default = client_stmt.default_compression.map(Compressor::from_id).transpose()?;
            (format, compressors, default, offset)
        }
    };

    if handshake.payload_len() > 0 {
        match role {
            Role::Client => {
                let signature = handshake.sign();
                write.write_all(&signature).await?;
                let ack = read.read_u8().await?;
                if ack != 1 {
                    return Err(CatsError::handshake("peer rejected handshake"));
                }
            }
            Role::Server => {
                let mut buf = vec![0u8; handshake.payload_len()];
                read.read_exact(&mut buf).await?;
                match handshake.verify(&buf) {
                    Ok(()) => write.write_u8(1).await?,
                    Err(err) => {
                        let _ = write.write_u8(0).await;
                        return Err(err);
                    }
                }
            }
        }
    }

    Ok(Negotiated { peer_api_version, peer_scheme_format, peer_compressors, peer_default_compression, clock_offset })
}

fn now_millis() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
