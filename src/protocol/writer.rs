//! Frame writer: assembles and writes one action's bytes.
//!
//! Callers are expected to serialize access through the connection's write
//! lock ([`crate::connection::scheduler`]); this type itself is not
//! synchronized. A single owner task writes; the sink has no internal
//! locking of its own.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::action::{Action, ActionId, Chunk};
use crate::error::Result;
use crate::headers::Headers;
use crate::scheme_format::SchemeFormat;

pub struct FrameWriter {
    pub scheme_format: SchemeFormat,
}

impl FrameWriter {
    pub fn new(scheme_format: SchemeFormat) -> Self {
        Self { scheme_format }
    }

    pub async fn write_action<W: AsyncWrite + Unpin>(&self, w: &mut W, action: &Action) -> Result<()> {
        match action {
            Action::Action { head, headers, payload } => {
                w.write_u8(ActionId::Action as u8).await?;
                w.write_u16(head.handler_id).await?;
                w.write_u16(head.message_id).await?;
                w.write_u64(head.send_time).await?;
                w.write_u8(head.data_type).await?;
                w.write_u8(head.compressor).await?;
                let blob = self.assemble_envelope(headers, payload)?;
                w.write_u32(blob.len() as u32).await?;
                w.write_all(&blob).await?;
            }
            Action::InputAction { head, headers, payload } => {
                w.write_u8(ActionId::InputAction as u8).await?;
                w.write_u16(head.message_id).await?;
                w.write_u8(head.data_type).await?;
                w.write_u8(head.compressor).await?;
                let blob = self.assemble_envelope(headers, payload)?;
                w.write_u32(blob.len() as u32).await?;
                w.write_all(&blob).await?;
            }
            Action::StreamAction { head, headers, chunks } => {
                w.write_u8(ActionId::StreamAction as u8).await?;
                w.write_u16(head.handler_id).await?;
                w.write_u16(head.message_id).await?;
                w.write_u64(head.send_time).await?;
                w.write_u8(head.data_type).await?;
                w.write_u8(head.compressor).await?;
                let header_bytes = self.scheme_format.encode_headers(headers)?;
                w.write_u32(header_bytes.len() as u32).await?;
                w.write_all(&header_bytes).await?;
                self.write_chunks(w, chunks).await?;
            }
            Action::DownloadSpeed { speed } => {
                w.write_u8(ActionId::DownloadSpeed as u8).await?;
                w.write_u32(*speed).await?;
            }
            Action::CancelInput { message_id } => {
                w.write_u8(ActionId::CancelInput as u8).await?;
                w.write_u16(*message_id).await?;
            }
            Action::Ping { send_time } => {
                w.write_u8(ActionId::Ping as u8).await?;
                w.write_u64(*send_time).await?;
            }
            Action::StartEncryption { payload } | Action::StopEncryption { payload } => {
                let id = action.action_id();
                w.write_u8(id as u8).await?;
                w.write_u32(payload.len() as u32).await?;
                w.write_all(payload).await?;
            }
        }
        w.flush().await?;
        Ok(())
    }

    async fn write_chunks<W: AsyncWrite + Unpin>(&self, w: &mut W, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            w.write_u32(chunk.bytes.len() as u32).await?;
            w.write_all(&chunk.bytes).await?;
        }
        w.write_u32(0).await?; // chunk-sequence terminator
        Ok(())
    }

    fn assemble_envelope(&self, headers: &Headers, payload: &[u8]) -> Result<Vec<u8>> {
        let header_bytes = self.scheme_format.encode_headers(headers)?;
        let mut blob = Vec::with_capacity(header_bytes.len() + 2 + payload.len());
        blob.extend_from_slice(&header_bytes);
        blob.extend_from_slice(&[0x00, 0x00]);
        blob.extend_from_slice(payload);
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::action::ActionHead;
    use crate::protocol::reader::FrameReader;

    #[tokio::test]
    async fn writes_and_reads_back_action() {
        let writer = FrameWriter::new(SchemeFormat::Json);
        let reader = FrameReader::new(8 * 1024 * 1024, SchemeFormat::Json);

        let mut headers = Headers::new();
        headers.set_status(200);
        let action = Action::Action {
            head: ActionHead { handler_id: 1, message_id: 0x42, send_time: 0, data_type: 0, compressor: 0, data_len: 0 },
            headers,
            payload: b"hello".to_vec(),
        };

        let (mut client, mut server) = tokio::io::duplex(4096);
        writer.write_action(&mut client, &action).await.unwrap();
        drop(client);

        let read_back = reader.read_action(&mut server).await.unwrap();
        match read_back {
            Action::Action { head, payload, headers, .. } => {
                assert_eq!(head.message_id, 0x42);
                assert_eq!(payload, b"hello");
                assert_eq!(headers.status(), 200);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_stream() {
        let writer = FrameWriter::new(SchemeFormat::Json);
        let reader = FrameReader::new(8 * 1024 * 1024, SchemeFormat::Json);

        let action = Action::StreamAction {
            head: crate::protocol::action::StreamActionHead {
                handler_id: 1,
                message_id: 9,
                send_time: 0,
                data_type: 0,
                compressor: 0,
            },
            headers: Headers::new(),
            chunks: vec![
                Chunk { bytes: b"hello".to_vec() },
                Chunk { bytes: b" world".to_vec() },
                Chunk { bytes: b"!".to_vec() },
            ],
        };

        let (mut client, mut server) = tokio::io::duplex(8192);
        writer.write_action(&mut client, &action).await.unwrap();
        drop(client);

        let read_back = reader.read_action(&mut server).await.unwrap();
        match read_back {
            Action::StreamAction { chunks, .. } => {
                let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.bytes).collect();
                assert_eq!(joined, b"hello world!");
            }
            _ => panic!("wrong variant"),
        }
    }
}
