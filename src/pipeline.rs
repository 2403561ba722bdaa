//! Codec pipeline: ties together [`crate::codec`], [`crate::compress`] and
//! [`crate::scheme_format`] into the outbound and inbound payload steps.

use crate::codec::{apply_offset_to_manifest, DataType, FileEntry, Payload};
use crate::compress::{self, mime_is_already_compressed, Compressor};
use crate::error::Result;
use crate::headers::Headers;
use crate::scheme_format::SchemeFormat;

pub struct EncodedAction {
    pub data_type: DataType,
    pub compressor: Compressor,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// Encode an outbound payload: codec-encode under `format`, apply any
/// `Offset` trim, then pick and apply a compressor.
///
/// `explicit_compressor` overrides the proposal heuristic; `peer_compressors`
/// is the peer's negotiated `compressors` list.
pub fn encode(
    payload: &Payload,
    format: SchemeFormat,
    mut headers: Headers,
    offset: Option<u64>,
    explicit_compressor: Option<Compressor>,
    peer_compressors: &[Compressor],
) -> Result<EncodedAction> {
    let data_type = payload.infer_data_type();
    let (mut bytes, codec_headers) = payload.encode(format)?;
    if let Some(h) = codec_headers {
        for (k, v) in h.into_map() {
            headers.insert(k, v);
        }
    }

    if let Some(offset) = offset {
        headers.set_offset(offset);
        let skip = (offset as usize).min(bytes.len());
        bytes.drain(..skip);
        if let Payload::Files { entries, .. } = payload {
            let trimmed = apply_offset_to_manifest(entries, offset);
            let json: Vec<serde_json::Value> = trimmed.iter().map(FileEntry::to_json).collect();
            headers.insert("Files", serde_json::Value::Array(json));
        }
    }

    let already_compressed = match payload {
        Payload::Files { entries, .. } => entries
            .iter()
            .all(|e| e.content_type.as_deref().is_some_and(mime_is_already_compressed)),
        _ => false,
    };

    let compressor = compress::propose(explicit_compressor, peer_compressors, bytes.len(), already_compressed);
    let compressed = compressor.compress(&bytes)?;

    Ok(EncodedAction { data_type, compressor, headers, payload: compressed })
}

/// Decode an inbound payload: decompress per `compressor`, then codec-decode
/// per `data_type` under `format`.
pub fn decode(data_type: DataType, compressor: Compressor, format: SchemeFormat, headers: &Headers, raw: Vec<u8>) -> Result<Payload> {
    let decompressed = compressor.decompress(&raw)?;
    Payload::decode(data_type, format, decompressed, headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_trims_bytes_and_sets_header() {
        let payload = Payload::Bytes(b"hello world".to_vec());
        let encoded = encode(&payload, SchemeFormat::Json, Headers::new(), Some(6), Some(Compressor::None), &[]).unwrap();
        assert_eq!(encoded.payload, b"world");
        assert_eq!(encoded.headers.offset(), Some(6));
    }

    #[test]
    fn files_offset_trims_manifest_and_buffer_consistently() {
        let entries = vec![
            FileEntry { key: "a".into(), name: "a.txt".into(), size: 5, content_type: None },
            FileEntry { key: "b".into(), name: "b.txt".into(), size: 5, content_type: None },
        ];
        let payload = Payload::Files { entries, buffer: b"helloworld".to_vec() };
        let encoded = encode(&payload, SchemeFormat::Json, Headers::new(), Some(7), Some(Compressor::None), &[]).unwrap();
        assert_eq!(encoded.payload.len(), 3);
        let files = encoded.headers.get("Files").unwrap().as_array().unwrap();
        let total: u64 = files.iter().map(|f| f["size"].as_u64().unwrap()).sum();
        assert_eq!(total as usize, encoded.payload.len());
    }

    #[test]
    fn roundtrip_through_compressor() {
        let payload = Payload::Bytes(b"x".repeat(5000));
        let encoded = encode(&payload, SchemeFormat::Json, Headers::new(), None, None, &[Compressor::Gzip]).unwrap();
        assert_eq!(encoded.compressor, Compressor::Gzip);
        let decoded = decode(encoded.data_type, encoded.compressor, SchemeFormat::Json, &encoded.headers, encoded.payload).unwrap();
        match decoded {
            Payload::Bytes(b) => assert_eq!(b, b"x".repeat(5000)),
            _ => panic!("wrong variant"),
        }
    }
}
