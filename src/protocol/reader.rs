//! Frame reader: reads one action at a time off an `AsyncRead` byte stream.
//!
//! A badly-framed action must not desynchronize the stream: once the head
//! has been parsed, the reader always consumes the full `data_len` (or the
//! whole stream-action chunk sequence) before surfacing a parse error, so
//! the next `read_action` call starts at the next action's tag byte.

use std::io::Write as _;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::action::{Action, ActionHead, ActionId, Chunk, InputActionHead, StreamActionHead};
use crate::codec::DataType;
use crate::compress::Compressor;
use crate::error::{CatsError, Result};
use crate::headers::Headers;
use crate::scheme_format::SchemeFormat;

/// Chunk sequence terminator for `StreamAction` bodies.
const STREAM_TERMINATOR: u32 = 0;
/// Two-byte separator between the header blob and the payload proper in a
/// non-stream envelope.
const HEADER_PAYLOAD_SEPARATOR: [u8; 2] = [0x00, 0x00];

pub struct FrameReader {
    /// Payloads at or above this size are spilled through a temp file while
    /// being read, bounding peak buffer growth for large transfers.
    pub spill_threshold: usize,
    pub scheme_format: SchemeFormat,
}

impl FrameReader {
    pub fn new(spill_threshold: usize, scheme_format: SchemeFormat) -> Self {
        Self { spill_threshold, scheme_format }
    }

    pub async fn read_action<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Action> {
        let action_id_raw = r.read_u8().await?;
        let action_id = ActionId::from_u8(action_id_raw)
            .ok_or_else(|| CatsError::protocol(format!("unknown action id 0x{action_id_raw:02x}")))?;

        match action_id {
            ActionId::Action => self.read_action_variant(r).await,
            ActionId::StreamAction => self.read_stream_action(r).await,
            ActionId::InputAction => self.read_input_action(r).await,
            ActionId::DownloadSpeed => Ok(Action::DownloadSpeed { speed: r.read_u32().await? }),
            ActionId::CancelInput => Ok(Action::CancelInput { message_id: r.read_u16().await? }),
            ActionId::Ping => Ok(Action::Ping { send_time: r.read_u64().await? }),
            ActionId::StartEncryption => Ok(Action::StartEncryption { payload: self.read_reserved_blob(r).await? }),
            ActionId::StopEncryption => Ok(Action::StopEncryption { payload: self.read_reserved_blob(r).await? }),
        }
    }

    async fn read_reserved_blob<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Vec<u8>> {
        // Reserved encryption actions carry no defined head shape yet; treat
        // any trailing bytes as opaque and do not attempt to parse them.
        let len = r.read_u32().await?;
        self.read_spilling(r, len as usize).await
    }

    async fn read_action_variant<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Action> {
        let handler_id = r.read_u16().await?;
        let message_id = r.read_u16().await?;
        let send_time = r.read_u64().await?;
        let data_type = r.read_u8().await?;
        let compressor = r.read_u8().await?;
        let data_len = r.read_u32().await?;

        let head = ActionHead { handler_id, message_id, send_time, data_type, compressor, data_len };

        // Consume the full envelope first so a parse failure below can't
        // desynchronize the stream.
        let blob = self.read_spilling(r, data_len as usize).await?;
        let (headers_bytes, payload) = split_envelope(&blob)?;
        let headers = self.scheme_format.decode_headers(headers_bytes)?;
        headers.validate_offset(payload.len())?;

        Ok(Action::Action { head, headers, payload: payload.to_vec() })
    }

    async fn read_input_action<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Action> {
        let message_id = r.read_u16().await?;
        let data_type = r.read_u8().await?;
        let compressor = r.read_u8().await?;
        let data_len = r.read_u32().await?;
        let head = InputActionHead { message_id, data_type, compressor, data_len };

        let blob = self.read_spilling(r, data_len as usize).await?;
        let (headers_bytes, payload) = split_envelope(&blob)?;
        let headers = self.scheme_format.decode_headers(headers_bytes)?;
        headers.validate_offset(payload.len())?;

        Ok(Action::InputAction { head, headers, payload: payload.to_vec() })
    }

    async fn read_stream_action<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Action> {
        let handler_id = r.read_u16().await?;
        let message_id = r.read_u16().await?;
        let send_time = r.read_u64().await?;
        let data_type = r.read_u8().await?;
        let compressor = r.read_u8().await?;
        let head = StreamActionHead { handler_id, message_id, send_time, data_type, compressor };

        let headers_size = r.read_u32().await?;
        let headers_bytes = self.read_spilling(r, headers_size as usize).await?;

        // Fully drain the chunk sequence before interpreting anything: a
        // stream cut short mid-chunk surfaces as a transport failure from
        // the read below, never as a partial-chunk delivery.
        let mut raw_chunks = Vec::new();
        loop {
            let chunk_size = r.read_u32().await?;
            if chunk_size == STREAM_TERMINATOR {
                break;
            }
            let chunk = self.read_spilling(r, chunk_size as usize).await?;
            raw_chunks.push(chunk);
        }

        let headers = self.scheme_format.decode_headers(&headers_bytes)?;

        let compressor = Compressor::from_id(compressor)?;
        let mut chunks = Vec::with_capacity(raw_chunks.len());
        for raw in raw_chunks {
            let bytes = compressor.decompress(&raw)?;
            chunks.push(Chunk { bytes });
        }

        let _ = DataType::from_id(head.data_type)?; // validated eagerly, decoded by the codec pipeline

        Ok(Action::StreamAction { head, headers, chunks })
    }

    /// Read exactly `len` bytes, spilling through a temp file once `len`
    /// crosses `spill_threshold` to bound peak in-memory growth during the
    /// read: never grow an unbounded buffer off a remote peer's declared
    /// length without a backstop.
    async fn read_spilling<R: AsyncRead + Unpin>(&self, r: &mut R, len: usize) -> Result<Vec<u8>> {
        if len < self.spill_threshold {
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).await?;
            return Ok(buf);
        }

        let mut tmp = NamedTempFile::new().map_err(CatsError::Transport)?;
        const CHUNK: usize = 64 * 1024;
        let mut remaining = len;
        let mut buf = vec![0u8; CHUNK.min(len)];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            r.read_exact(&mut buf[..take]).await?;
            tmp.write_all(&buf[..take]).map_err(CatsError::Transport)?;
            remaining -= take;
        }
        std::fs::read(tmp.path()).map_err(CatsError::Transport)
    }
}

/// Split `headers_utf8 ++ 0x00 0x00 ++ payload_bytes` at the first `0x00 0x00`
/// separator.
fn split_envelope(blob: &[u8]) -> Result<(&[u8], &[u8])> {
    let idx = blob
        .windows(2)
        .position(|w| w == HEADER_PAYLOAD_SEPARATOR)
        .ok_or_else(|| CatsError::protocol("missing header/payload separator"))?;
    Ok((&blob[..idx], &blob[idx + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn reader() -> FrameReader {
        FrameReader::new(8 * 1024 * 1024, SchemeFormat::Json)
    }

    #[test]
    fn splits_envelope_on_separator() {
        let blob = b"{}\x00\x00hello";
        let (h, p) = split_envelope(blob).unwrap();
        assert_eq!(h, b"{}");
        assert_eq!(p, b"hello");
    }

    #[test]
    fn missing_separator_is_protocol_error() {
        assert!(split_envelope(b"no separator here").is_err());
    }

    #[tokio::test]
    async fn reads_happy_action() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client.write_u8(0x00).await.unwrap(); // Action
            client.write_u16(1).await.unwrap(); // handler_id
            client.write_u16(0x42).await.unwrap(); // message_id
            client.write_u64(0).await.unwrap(); // send_time
            client.write_u8(0x00).await.unwrap(); // data_type Binary
            client.write_u8(0x00).await.unwrap(); // compressor None
            let blob = b"{}\x00\x00hello";
            client.write_u32(blob.len() as u32).await.unwrap();
            client.write_all(blob).await.unwrap();
            client.flush().await.unwrap();
        });

        let action = reader().read_action(&mut server).await.unwrap();
        match action {
            Action::Action { head, payload, .. } => {
                assert_eq!(head.message_id, 0x42);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn stream_action_decompresses_chunks() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            client.write_u8(0x01).await.unwrap(); // StreamAction
            client.write_u16(1).await.unwrap();
            client.write_u16(5).await.unwrap();
            client.write_u64(0).await.unwrap();
            client.write_u8(0x00).await.unwrap(); // Binary
            client.write_u8(0x00).await.unwrap(); // no compression
            client.write_u32(0).await.unwrap(); // empty headers
            for part in [&b"hello"[..], &b" world"[..], &b"!"[..]] {
                client.write_u32(part.len() as u32).await.unwrap();
                client.write_all(part).await.unwrap();
            }
            client.write_u32(0).await.unwrap(); // terminator
            client.flush().await.unwrap();
        });

        let action = reader().read_action(&mut server).await.unwrap();
        match action {
            Action::StreamAction { chunks, .. } => {
                let concatenated: Vec<u8> = chunks.into_iter().flat_map(|c| c.bytes).collect();
                assert_eq!(concatenated, b"hello world!");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn malformed_header_still_consumes_full_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client.write_u8(0x00).await.unwrap();
            client.write_u16(1).await.unwrap();
            client.write_u16(2).await.unwrap();
            client.write_u64(0).await.unwrap();
            client.write_u8(0x00).await.unwrap();
            client.write_u8(0x00).await.unwrap();
            let blob = b"no separator here";
            client.write_u32(blob.len() as u32).await.unwrap();
            client.write_all(blob).await.unwrap();
            // A second, well-formed action right after: if the first frame
            // wasn't fully consumed, this read will desync and fail.
            client.write_u8(0xFF).await.unwrap();
            client.write_u64(7).await.unwrap();
            client.flush().await.unwrap();
        });

        let r = reader();
        assert!(r.read_action(&mut server).await.is_err());
        let next = r.read_action(&mut server).await.unwrap();
        match next {
            Action::Ping { send_time } => assert_eq!(send_time, 7),
            _ => panic!("stream desynchronized after malformed frame"),
        }
    }
}
