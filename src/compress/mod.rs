//! Compressor registry: none / gzip / zlib, with an "is it worth it"
//! proposal heuristic.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::{CatsError, Result};

/// Payloads smaller than this are never worth compressing; the framing and
/// CPU overhead outweighs the savings.
pub const MIN_COMPRESS_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Compressor {
    None = 0x00,
    Gzip = 0x01,
    Zlib = 0x02,
}

impl Compressor {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Gzip),
            0x02 => Ok(Self::Zlib),
            other => Err(CatsError::protocol(format!("unknown compressor id 0x{other:02x}"))),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::new(6));
                enc.write_all(data)
                    .map_err(|e| CatsError::protocol(format!("gzip compress failed: {e}")))?;
                enc.finish()
                    .map_err(|e| CatsError::protocol(format!("gzip compress failed: {e}")))
            }
            Self::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(6));
                enc.write_all(data)
                    .map_err(|e| CatsError::protocol(format!("zlib compress failed: {e}")))?;
                enc.finish()
                    .map_err(|e| CatsError::protocol(format!("zlib compress failed: {e}")))
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| CatsError::protocol(format!("gzip decompress failed: {e}")))?;
                Ok(out)
            }
            Self::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| CatsError::protocol(format!("zlib decompress failed: {e}")))?;
                Ok(out)
            }
        }
    }
}

/// MIME/extension suffixes treated as already-compressed for the heuristic
/// below (Files payloads whose entries match these are never compressed).
const ALREADY_COMPRESSED_SUFFIXES: &[&str] = &[
    ".zip", ".gz", ".7z", ".rar", ".mp4", ".mp3", ".jpg", ".jpeg", ".png", ".webp", ".webm",
];

pub fn mime_is_already_compressed(mime_or_name: &str) -> bool {
    let lower = mime_or_name.to_ascii_lowercase();
    if lower.starts_with("image/") || lower.starts_with("video/") || lower.starts_with("audio/") {
        return true;
    }
    ALREADY_COMPRESSED_SUFFIXES
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

/// Pick a compressor for an outbound payload: the caller's explicit choice if
/// given, else the first of `peer_supported` this side also supports, unless
/// the heuristic says compression isn't worthwhile.
pub fn propose(
    explicit: Option<Compressor>,
    peer_supported: &[Compressor],
    payload_len: usize,
    already_compressed: bool,
) -> Compressor {
    if let Some(c) = explicit {
        return c;
    }
    if payload_len < MIN_COMPRESS_SIZE || already_compressed {
        return Compressor::None;
    }
    peer_supported
        .iter()
        .copied()
        .find(|c| *c != Compressor::None)
        .unwrap_or(Compressor::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_roundtrip() {
        let data = b"hello world".repeat(100);
        let compressed = Compressor::Gzip.compress(&data).unwrap();
        let back = Compressor::Gzip.decompress(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn zlib_roundtrip() {
        let data = b"hello world".repeat(100);
        let compressed = Compressor::Zlib.compress(&data).unwrap();
        let back = Compressor::Zlib.decompress(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn none_roundtrip() {
        let data = b"hello";
        let compressed = Compressor::None.compress(data).unwrap();
        assert_eq!(compressed, data);
        assert_eq!(Compressor::None.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn small_payload_is_not_compressed() {
        let chosen = propose(None, &[Compressor::Gzip], 10, false);
        assert_eq!(chosen, Compressor::None);
    }

    #[test]
    fn large_payload_picks_peer_compressor() {
        let chosen = propose(None, &[Compressor::Zlib, Compressor::Gzip], 5000, false);
        assert_eq!(chosen, Compressor::Zlib);
    }

    #[test]
    fn already_compressed_skips_heuristic() {
        let chosen = propose(None, &[Compressor::Gzip], 5000, true);
        assert_eq!(chosen, Compressor::None);
    }

    #[test]
    fn mime_detection() {
        assert!(mime_is_already_compressed("image/png"));
        assert!(mime_is_already_compressed("archive.zip"));
        assert!(!mime_is_already_compressed("text/plain"));
    }
}
