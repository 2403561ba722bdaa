//! `RUNNING`-state read loop: pulls one action at a time off the transport,
//! classifies it, and either wakes a waiter or spawns a handler subtask.
//! Reads over a single owned read half: read a frame, look up its id, route
//! it.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::codec::{DataType, Payload};
use crate::compress::Compressor;
use crate::context::HandlerContext;
use crate::error::{CatsError, ClosedReason};
use crate::handler::Lookup;
use crate::protocol::{Action, FrameReader};

use super::mux::Classification;
use super::{ConnectionInner, Role};

pub(crate) async fn run<R>(inner: Arc<ConnectionInner>, mut read: R, reader: FrameReader)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let read_result = match inner.config().idle_timeout() {
            Some(d) => match tokio::time::timeout(d, reader.read_action(&mut read)).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::info!("connection idle, closing");
                    close_with_reason(&inner, ClosedReason::Idle).await;
                    return;
                }
            },
            None => reader.read_action(&mut read).await,
        };

        match read_result {
            Ok(action) => {
                inner.touch();
                handle_inbound(&inner, action).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "closing connection after read error");
                close_with_reason(&inner, ClosedReason::Protocol).await;
                return;
            }
        }
    }
}

async fn close_with_reason(inner: &Arc<ConnectionInner>, reason: ClosedReason) {
    inner.mark_closed();
    inner.mux.lock().await.cancel_all();
    let _ = reason;
}

async fn handle_inbound(inner: &Arc<ConnectionInner>, action: Action) {
    match action {
        Action::Ping { .. } => {
            // Receipt alone already counts as activity (touched by the caller).
            // Only the client side echoes: the server is the one running the
            // proactive ping loop (`super::ping`), so echoing there too would
            // bounce a ping back and forth between the two sides forever.
            if inner.role == Role::Client {
                let send_time = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                if let Err(err) = inner.send_raw(&Action::Ping { send_time }).await {
                    tracing::debug!(error = %err, "ping echo failed");
                }
            }
        }
        Action::DownloadSpeed { speed } => {
            inner.scheduler.set_download_speed(speed as u64).await;
        }
        Action::CancelInput { message_id } => {
            if let Err(err) = inner.mux.lock().await.resolve_cancel(message_id) {
                tracing::warn!(error = %err, "cancel for unknown message_id");
            }
        }
        Action::StartEncryption { .. } | Action::StopEncryption { .. } => {
            // Reserved; tolerated as a no-op.
        }
        Action::InputAction { .. } => {
            let message_id = action.message_id().expect("InputAction always carries a message_id");
            if let Err(err) = inner.mux.lock().await.resolve_input(message_id, action) {
                tracing::warn!(error = %err, "input reply with no pending ask()");
            }
        }
        Action::Action { head, headers, payload } => {
            let message_id = head.message_id;
            let classification = inner.mux.lock().await.classify(message_id);
            match classification {
                Classification::Reply => {
                    let reassembled = Action::Action { head, headers, payload };
                    if let Err(err) = inner.mux.lock().await.resolve_reply(message_id, reassembled) {
                        tracing::warn!(error = %err, "duplicate reply");
                    }
                }
                Classification::Broadcast => {
                    let channel = broadcast_channel(head.handler_id, &headers);
                    let action = Action::Action { head, headers, payload };
                    inner.broadcast.publish(&channel, action).await;
                }
                Classification::NewRequest => {
                    inner.mux.lock().await.reserve_incoming(message_id);
                    spawn_handler(inner.clone(), head.handler_id, message_id, head.data_type, head.compressor, headers, payload);
                }
                Classification::Duplicate => {
                    tracing::warn!(message_id, "dropping duplicate/unexpected action");
                }
            }
        }
        Action::StreamAction { head, headers, chunks } => {
            let message_id = head.message_id;
            let classification = inner.mux.lock().await.classify(message_id);
            let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.bytes).collect();
            match classification {
                Classification::Reply => {
                    let reassembled = Action::Action {
                        head: crate::protocol::action::ActionHead {
                            handler_id: head.handler_id,
                            message_id,
                            send_time: head.send_time,
                            data_type: head.data_type,
                            compressor: 0,
                            data_len: joined.len() as u32,
                        },
                        headers,
                        payload: joined,
                    };
                    if let Err(err) = inner.mux.lock().await.resolve_reply(message_id, reassembled) {
                        tracing::warn!(error = %err, "duplicate stream reply");
                    }
                }
                Classification::Broadcast => {
                    let channel = broadcast_channel(head.handler_id, &headers);
                    let action = Action::Action {
                        head: crate::protocol::action::ActionHead {
                            handler_id: head.handler_id,
                            message_id,
                            send_time: head.send_time,
                            data_type: head.data_type,
                            compressor: 0,
                            data_len: joined.len() as u32,
                        },
                        headers,
                        payload: joined,
                    };
                    inner.broadcast.publish(&channel, action).await;
                }
                Classification::NewRequest => {
                    inner.mux.lock().await.reserve_incoming(message_id);
                    // Chunks already decompressed in the frame reader.
                    spawn_handler(inner.clone(), head.handler_id, message_id, head.data_type, Compressor::None.id(), headers, joined);
                }
                Classification::Duplicate => {
                    tracing::warn!(message_id, "dropping duplicate/unexpected stream action");
                }
            }
        }
    }
}

/// Channel name an inbound broadcast push is published under: the `Channel`
/// header if the peer set one, else a per-`handler_id` fallback.
fn broadcast_channel(handler_id: u16, headers: &crate::headers::Headers) -> String {
    headers
        .get("Channel")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("handler:{handler_id}"))
}

fn spawn_handler(
    inner: Arc<ConnectionInner>,
    handler_id: u16,
    message_id: u16,
    data_type: u8,
    compressor: u8,
    headers: crate::headers::Headers,
    raw_payload: Vec<u8>,
) {
    tokio::spawn(async move {
        let outcome = run_handler(&inner, handler_id, message_id, data_type, compressor, headers, raw_payload).await;
        inner.mux.lock().await.release(message_id);
        if let Err(err) = outcome {
            if err.is_fatal() {
                tracing::warn!(handler_id, message_id, error = %err, "handler failed");
            } else {
                tracing::warn!(handler_id, message_id, error = %err, "handler failed, returning error response");
                send_error_reply(&inner, handler_id, message_id, &err).await;
            }
        }
    });
}

/// Status code an unhandled, non-fatal handler error is reported to the
/// requester under. Everything else maps to a generic 500.
fn error_status(err: &CatsError) -> u16 {
    match err {
        CatsError::Validation(_) | CatsError::InputLimitExceeded { .. } | CatsError::InputCancelled => 400,
        _ => 500,
    }
}

/// Send an error response action to the requester's `message_id` when a
/// handler fails without producing a reply of its own. Never called for a
/// fatal error: those already tear the connection down elsewhere.
async fn send_error_reply(inner: &Arc<ConnectionInner>, handler_id: u16, message_id: u16, err: &crate::error::CatsError) {
    let mut headers = crate::headers::Headers::new();
    headers.set_status(error_status(err));
    let reply = Action::Action {
        head: crate::protocol::action::ActionHead {
            handler_id,
            message_id,
            send_time: 0,
            data_type: 0,
            compressor: 0,
            data_len: 0,
        },
        headers,
        payload: Vec::new(),
    };
    if let Err(send_err) = inner.send_raw(&reply).await {
        tracing::warn!(handler_id, message_id, error = %send_err, "failed to send error response");
    }
}

async fn run_handler(
    inner: &Arc<ConnectionInner>,
    handler_id: u16,
    message_id: u16,
    data_type: u8,
    compressor: u8,
    headers: crate::headers::Headers,
    raw_payload: Vec<u8>,
) -> crate::error::Result<()> {
    let data_type = DataType::from_id(data_type)?;
    let compressor = Compressor::from_id(compressor)?;
    let payload = if compressor == Compressor::None {
        Payload::decode(data_type, inner.peer_scheme_format, raw_payload, &headers)?
    } else {
        crate::pipeline::decode(data_type, compressor, inner.peer_scheme_format, &headers, raw_payload)?
    };

    let handler = match inner.registry().lookup(handler_id, inner.peer_api_version()) {
        Lookup::Found(handler) => handler,
        Lookup::NotFound => {
            return Err(CatsError::validation(format!("no handler registered for handler_id {handler_id}")));
        }
    };

    let action = Action::Action {
        head: crate::protocol::action::ActionHead {
            handler_id,
            message_id,
            send_time: 0,
            data_type: data_type as u8,
            compressor: compressor.id(),
            data_len: 0,
        },
        headers,
        payload: Vec::new(),
    };

    let ctx = HandlerContext {
        inner: inner.clone(),
        action,
        payload,
        handler_id,
        message_id,
        ask_count: Arc::new(AtomicU32::new(0)),
        bypass_count: std::sync::atomic::AtomicBool::new(false),
    };

    handler.prepare(&ctx).await?;
    if let Some(reply) = handler.handle(&ctx).await? {
        inner.send_raw(&reply).await?;
    }
    Ok(())
}
