//! `Headers`: the short ASCII-keyed metadata map carried alongside a payload.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{CatsError, Result};

/// Default HTTP-style status used when a response carries no `Status` header.
pub const DEFAULT_STATUS: u16 = 200;

/// A mapping from short ASCII header name to a JSON scalar or array value.
///
/// Backed by a `BTreeMap` so encoding is byte-stable across runs, which
/// matters for anything hashing or diffing wire output in tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(BTreeMap<String, Value>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Status` header, shadowing [`DEFAULT_STATUS`] when present.
    pub fn status(&self) -> u16 {
        self.0
            .get("Status")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_STATUS)
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.insert("Status", status)
    }

    /// `Offset` header: bytes already possessed by the peer. Must be
    /// non-negative (guaranteed by the `u64` type) and `<= payload_len`,
    /// validated by [`Headers::validate_offset`].
    pub fn offset(&self) -> Option<u64> {
        self.0.get("Offset").and_then(Value::as_u64)
    }

    pub fn set_offset(&mut self, offset: u64) -> &mut Self {
        self.insert("Offset", offset)
    }

    pub fn validate_offset(&self, payload_len: usize) -> Result<()> {
        if let Some(offset) = self.offset() {
            if offset > payload_len as u64 {
                return Err(CatsError::protocol(format!(
                    "Offset {offset} exceeds payload length {payload_len}"
                )));
            }
        }
        Ok(())
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.0
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl From<BTreeMap<String, Value>> for Headers {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_200() {
        let h = Headers::new();
        assert_eq!(h.status(), 200);
    }

    #[test]
    fn status_header_shadows_default() {
        let mut h = Headers::new();
        h.set_status(404);
        assert_eq!(h.status(), 404);
    }

    #[test]
    fn offset_validation_rejects_overrun() {
        let mut h = Headers::new();
        h.set_offset(10);
        assert!(h.validate_offset(5).is_err());
        assert!(h.validate_offset(10).is_ok());
        assert!(h.validate_offset(20).is_ok());
    }
}
