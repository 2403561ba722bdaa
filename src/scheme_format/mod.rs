//! Scheme-format registry: JSON/YAML/TOML (de)serialization with
//! auto-detection for statements. The receiving side infers JSON, YAML or
//! TOML from the leading bytes rather than requiring the format up front.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{CatsError, Result};
use crate::headers::Headers;

/// Negotiated structured-data encoding for statements and `Scheme`-typed
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemeFormat {
    Json,
    Yaml,
    Toml,
}

impl SchemeFormat {
    /// Leading-character heuristic used during statement exchange to guess
    /// the peer's format from raw bytes it sent.
    ///
    /// `{` or `[` → JSON; `%`, `---`, or an indented `key:` line → YAML;
    /// anything else → TOML.
    pub fn detect(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Self::Json;
        }
        if trimmed.starts_with('%') || trimmed.starts_with("---") {
            return Self::Yaml;
        }
        if looks_like_yaml_mapping(trimmed) {
            return Self::Yaml;
        }
        Self::Toml
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| CatsError::protocol(format!("JSON encode failed: {e}"))),
            Self::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| CatsError::protocol(format!("YAML encode failed: {e}"))),
            Self::Toml => toml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| CatsError::protocol(format!("TOML encode failed: {e}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| CatsError::protocol(format!("JSON decode failed: {e}"))),
            Self::Yaml => serde_yaml::from_slice(bytes)
                .map_err(|e| CatsError::protocol(format!("YAML decode failed: {e}"))),
            Self::Toml => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| CatsError::protocol(format!("TOML is not UTF-8: {e}")))?;
                toml::from_str(text).map_err(|e| CatsError::protocol(format!("TOML decode failed: {e}")))
            }
        }
    }

    /// Decode a `Headers` map in this format.
    pub fn decode_headers(self, bytes: &[u8]) -> Result<Headers> {
        if bytes.is_empty() {
            return Ok(Headers::new());
        }
        let map: BTreeMap<String, Value> = self.decode(bytes)?;
        Ok(Headers::from_map(map))
    }

    pub fn encode_headers(self, headers: &Headers) -> Result<Vec<u8>> {
        if headers.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(headers.as_map())
    }
}

/// `true` for a leading `key: value` or indented-mapping line, the shape an
/// unmarked YAML document (no `---`/`%YAML`) starts with.
fn looks_like_yaml_mapping(text: &str) -> bool {
    let Some(line) = text.lines().next() else {
        return false;
    };
    let Some((key, _)) = line.split_once(':') else {
        return false;
    };
    let key = key.trim_start();
    !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_json_by_brace() {
        assert_eq!(SchemeFormat::detect(b"{\"a\":1}"), SchemeFormat::Json);
        assert_eq!(SchemeFormat::detect(b"[1,2,3]"), SchemeFormat::Json);
    }

    #[test]
    fn detects_yaml_by_marker() {
        assert_eq!(SchemeFormat::detect(b"---\napi: 1\n"), SchemeFormat::Yaml);
        assert_eq!(SchemeFormat::detect(b"%YAML 1.1\n"), SchemeFormat::Yaml);
        assert_eq!(SchemeFormat::detect(b"api: 1\nclient_time: 2\n"), SchemeFormat::Yaml);
    }

    #[test]
    fn falls_back_to_toml() {
        assert_eq!(SchemeFormat::detect(b"api = 1\n"), SchemeFormat::Toml);
    }

    #[test]
    fn json_roundtrip() {
        let mut h = Headers::new();
        h.set_status(201);
        let bytes = SchemeFormat::Json.encode_headers(&h).unwrap();
        let back = SchemeFormat::Json.decode_headers(&bytes).unwrap();
        assert_eq!(back.status(), 201);
    }
}
