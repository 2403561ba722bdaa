//! `Files` codec: the multi-file bundle payload and its manifest header.

use serde_json::Value;

use crate::error::{CatsError, Result};
use crate::headers::Headers;

/// One entry in the `Files` header's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
}

impl FileEntry {
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("key".into(), Value::String(self.key.clone()));
        obj.insert("name".into(), Value::String(self.name.clone()));
        obj.insert("size".into(), Value::Number(self.size.into()));
        if let Some(ct) = &self.content_type {
            obj.insert("type".into(), Value::String(ct.clone()));
        }
        Value::Object(obj)
    }

    fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CatsError::protocol("Files entry must be an object"))?;
        let key = obj
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| CatsError::protocol("Files entry missing 'key'"))?
            .to_string();
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CatsError::protocol("Files entry missing 'name'"))?
            .to_string();
        let size = obj
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| CatsError::protocol("Files entry missing 'size'"))?;
        let content_type = obj.get("type").and_then(Value::as_str).map(str::to_string);
        Ok(Self { key, name, size, content_type })
    }

    /// Parse the `Files` header's manifest list.
    pub fn list_from_headers(headers: &Headers) -> Result<Vec<Self>> {
        let Some(files) = headers.get("Files") else {
            return Ok(Vec::new());
        };
        let arr = files
            .as_array()
            .ok_or_else(|| CatsError::protocol("'Files' header must be an array"))?;
        arr.iter().map(Self::from_json).collect()
    }
}

/// Split a concatenated file-bundle buffer into per-file byte slices, in
/// manifest order: the payload is the concatenation of file bytes in list
/// order.
pub fn split_files<'a>(entries: &[FileEntry], buffer: &'a [u8]) -> Result<Vec<(&'a FileEntry, &'a [u8])>> {
    let mut out = Vec::with_capacity(entries.len());
    let mut cursor = 0usize;
    for entry in entries {
        let end = cursor
            .checked_add(entry.size as usize)
            .ok_or_else(|| CatsError::protocol("Files entry size overflow"))?;
        if end > buffer.len() {
            return Err(CatsError::protocol(format!(
                "Files buffer too short: entry '{}' needs {} bytes but only {} remain",
                entry.name,
                entry.size,
                buffer.len() - cursor
            )));
        }
        out.push((entry, &buffer[cursor..end]));
        cursor = end;
    }
    Ok(out)
}

/// Apply an `Offset` to a `Files` manifest: subtract skipped bytes from each
/// entry's `size` in list order until exhausted, dropping entries whose size
/// becomes zero.
pub fn apply_offset_to_manifest(entries: &[FileEntry], mut offset: u64) -> Vec<FileEntry> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if offset == 0 {
            out.push(entry.clone());
            continue;
        }
        if offset >= entry.size {
            offset -= entry.size;
            continue;
        }
        let mut trimmed = entry.clone();
        trimmed.size -= offset;
        offset = 0;
        out.push(trimmed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry { key: "a".into(), name: "a.txt".into(), size: 3, content_type: None },
            FileEntry { key: "b".into(), name: "b.txt".into(), size: 2, content_type: None },
        ]
    }

    #[test]
    fn split_files_in_order() {
        let buf = b"abcde";
        let split = split_files(&entries(), buf).unwrap();
        assert_eq!(split[0].1, b"abc");
        assert_eq!(split[1].1, b"de");
    }

    #[test]
    fn split_files_rejects_short_buffer() {
        assert!(split_files(&entries(), b"ab").is_err());
    }

    #[test]
    fn offset_trims_and_drops_entries() {
        let trimmed = apply_offset_to_manifest(&entries(), 4);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].name, "b.txt");
        assert_eq!(trimmed[0].size, 1);
    }

    #[test]
    fn offset_of_zero_is_identity() {
        let trimmed = apply_offset_to_manifest(&entries(), 0);
        assert_eq!(trimmed, entries());
    }
}
