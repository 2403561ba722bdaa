//! Codec registry: the payload `data_type` byte and its conversion to/from
//! the discriminated [`Payload`] union.

mod files;

pub use files::{apply_offset_to_manifest, split_files, FileEntry};

use serde_json::Value;

use crate::error::{CatsError, Result};
use crate::headers::Headers;
use crate::scheme_format::SchemeFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Binary = 0x00,
    Scheme = 0x01,
    Files = 0x02,
    ByteScheme = 0x03,
}

impl DataType {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::Binary),
            0x01 => Ok(Self::Scheme),
            0x02 => Ok(Self::Files),
            0x03 => Ok(Self::ByteScheme),
            other => Err(CatsError::protocol(format!("unknown data type 0x{other:02x}"))),
        }
    }
}

/// A decoded/pending-encode payload, discriminated by [`DataType`].
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Scheme(Value),
    Files { entries: Vec<FileEntry>, buffer: Vec<u8> },
    ByteScheme(Vec<u8>),
}

impl Payload {
    /// Infer the codec from the payload's shape.
    pub fn infer_data_type(&self) -> DataType {
        match self {
            Self::Bytes(_) => DataType::Binary,
            Self::Scheme(_) => DataType::Scheme,
            Self::Files { .. } => DataType::Files,
            Self::ByteScheme(_) => DataType::ByteScheme,
        }
    }

    /// Encode to raw bytes under the negotiated scheme format. For `Files`,
    /// also returns the `Files` header to attach to the envelope.
    pub fn encode(&self, format: SchemeFormat) -> Result<(Vec<u8>, Option<Headers>)> {
        match self {
            Self::Bytes(b) => Ok((b.clone(), None)),
            Self::ByteScheme(b) => Ok((b.clone(), None)),
            Self::Scheme(value) => Ok((format.encode(value)?, None)),
            Self::Files { entries, buffer } => {
                let files_json: Vec<Value> = entries.iter().map(FileEntry::to_json).collect();
                let mut headers = Headers::new();
                headers.insert("Files", Value::Array(files_json));
                Ok((buffer.clone(), Some(headers)))
            }
        }
    }

    /// Decode raw bytes per `data_type`, using `headers` for `Files`'
    /// manifest.
    pub fn decode(data_type: DataType, format: SchemeFormat, bytes: Vec<u8>, headers: &Headers) -> Result<Self> {
        match data_type {
            DataType::Binary => Ok(Self::Bytes(bytes)),
            DataType::ByteScheme => Ok(Self::ByteScheme(bytes)),
            DataType::Scheme => Ok(Self::Scheme(format.decode(&bytes)?)),
            DataType::Files => {
                let entries = FileEntry::list_from_headers(headers)?;
                Ok(Self::Files { entries, buffer: bytes })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_binary_for_bytes() {
        let p = Payload::Bytes(vec![1, 2, 3]);
        assert_eq!(p.infer_data_type(), DataType::Binary);
    }

    #[test]
    fn infers_scheme_for_json_value() {
        let p = Payload::Scheme(serde_json::json!({"a": 1}));
        assert_eq!(p.infer_data_type(), DataType::Scheme);
    }

    #[test]
    fn scheme_roundtrip_json() {
        let p = Payload::Scheme(serde_json::json!({"hello": "world"}));
        let (bytes, _) = p.encode(SchemeFormat::Json).unwrap();
        let back = Payload::decode(DataType::Scheme, SchemeFormat::Json, bytes, &Headers::new()).unwrap();
        match back {
            Payload::Scheme(v) => assert_eq!(v, serde_json::json!({"hello": "world"})),
            _ => panic!("wrong variant"),
        }
    }
}
