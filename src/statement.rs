//! The opening self-description each peer sends during `STATEMENT_EXCHANGE`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compress::Compressor;
use crate::error::{CatsError, Result};
use crate::scheme_format::SchemeFormat;

/// Client-side statement: api version, local clock, and negotiated codec
/// capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatement {
    pub api: u32,
    pub client_time: u64,
    pub scheme_format: SchemeFormat,
    pub compressors: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_compression: Option<u8>,
    /// Forward-compatible extension bag; round-tripped but never interpreted
    /// by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ClientStatement {
    pub fn new(api: u32, client_time: u64, scheme_format: SchemeFormat, compressors: Vec<Compressor>) -> Result<Self> {
        if compressors.is_empty() {
            return Err(CatsError::protocol("ClientStatement.compressors must be non-empty"));
        }
        Ok(Self {
            api,
            client_time,
            scheme_format,
            compressors: compressors.iter().map(|c| c.id()).collect(),
            default_compression: None,
            extra: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.compressors.is_empty() {
            return Err(CatsError::protocol("statement.compressors must be non-empty"));
        }
        if let Some(default) = self.default_compression {
            if !self.compressors.contains(&default) {
                return Err(CatsError::protocol(
                    "statement.default_compression must be one of statement.compressors",
                ));
            }
        }
        Ok(())
    }

    pub fn compressor_ids(&self) -> Result<Vec<Compressor>> {
        self.compressors.iter().map(|id| Compressor::from_id(*id)).collect()
    }
}

/// Server-side statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatement {
    pub server_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ServerStatement {
    pub fn new(server_time: u64) -> Self {
        Self { server_time, extra: None }
    }
}

/// Clock offset `= server_time - client_time`, stored to correct outbound
/// `send_time` fields.
pub fn clock_offset(server_time: u64, client_time: u64) -> i64 {
    server_time as i64 - client_time as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_compressors() {
        let err = ClientStatement::new(1, 0, SchemeFormat::Json, vec![]);
        assert!(err.is_err());
    }

    #[test]
    fn validate_rejects_default_not_in_list() {
        let mut s = ClientStatement::new(1, 0, SchemeFormat::Json, vec![Compressor::Gzip]).unwrap();
        s.default_compression = Some(Compressor::Zlib.id());
        assert!(s.validate().is_err());
    }

    #[test]
    fn clock_offset_known_values() {
        let offset = clock_offset(1629439551000, 1629439550942);
        assert_eq!(offset, 58);
    }
}
