//! Safetensors header parsing.
//!
//! A safetensors file is an 8-byte little-endian header length followed by
//! that many bytes of JSON describing each tensor, plus a reserved
//! `__metadata__` key of free-form string pairs. Format reference:
//! <https://github.com/huggingface/safetensors#format>

use crate::error::{ParseError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Upper bound on the JSON header length. The format itself allows 100MB;
/// anything larger is treated as corruption.
pub const MAX_HEADER_LEN: u64 = 100_000_000;

/// One tensor entry of the header map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TensorEntry {
    pub dtype: String,
    pub shape: Vec<u64>,
    /// Begin/end byte offsets into the data section.
    pub data_offsets: (u64, u64),
}

/// A decoded safetensors header.
#[derive(Debug, Clone, Default)]
pub struct SafetensorsHeader {
    pub tensors: BTreeMap<String, TensorEntry>,
    /// Free-form string pairs from the `__metadata__` key.
    pub metadata: BTreeMap<String, String>,
}

impl SafetensorsHeader {
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Distinct dtypes present, sorted.
    pub fn dtypes(&self) -> Vec<&str> {
        let mut dtypes: Vec<&str> = self.tensors.values().map(|t| t.dtype.as_str()).collect();
        dtypes.sort_unstable();
        dtypes.dedup();
        dtypes
    }
}

/// There is no magic number; the convention is the file extension.
pub fn is_safetensors_name(name: &str) -> bool {
    name.ends_with(".safetensors") || name.ends_with(".safetensor")
}

/// Parse the header of the safetensors file at `path`.
pub fn parse_file(path: impl AsRef<Path>) -> Result<SafetensorsHeader> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    parse(file, len)
}

/// Parse a safetensors header from `reader`; `budget` is the total number of
/// bytes available.
pub fn parse<R: Read>(mut reader: R, budget: u64) -> Result<SafetensorsHeader> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes);

    if header_len > MAX_HEADER_LEN {
        return Err(ParseError::MalformedHeader(format!(
            "implausible header length {header_len}"
        )));
    }
    if header_len.saturating_add(8) > budget {
        return Err(ParseError::MalformedHeader(format!(
            "header length {header_len} exceeds file size {budget}"
        )));
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_bytes)?;

    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&header_bytes)
        .map_err(|e| ParseError::MalformedHeader(format!("header is not valid JSON: {e}")))?;

    let mut header = SafetensorsHeader::default();
    for (key, value) in raw {
        if key == "__metadata__" {
            header.metadata = serde_json::from_value(value).map_err(|e| {
                ParseError::MalformedHeader(format!("__metadata__ is not a string map: {e}"))
            })?;
            continue;
        }
        let entry: TensorEntry = serde_json::from_value(value).map_err(|e| {
            ParseError::MalformedHeader(format!("invalid tensor entry '{key}': {e}"))
        })?;
        if entry.data_offsets.1 < entry.data_offsets.0 {
            return Err(ParseError::MalformedHeader(format!(
                "tensor '{key}' has reversed data offsets"
            )));
        }
        header.tensors.insert(key, entry);
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn encode(json: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(json.len() as u64).to_le_bytes());
        bytes.extend_from_slice(json.as_bytes());
        bytes
    }

    #[test]
    fn test_parse_header() {
        let json = r#"{
            "__metadata__": {"format": "pt"},
            "model.embed_tokens.weight": {"dtype": "F16", "shape": [32000, 4096], "data_offsets": [0, 262144000]}
        }"#;
        let bytes = encode(json);

        let header = parse(bytes.as_slice(), bytes.len() as u64).unwrap();
        assert_eq!(header.tensor_count(), 1);
        assert_eq!(header.metadata.get("format").map(String::as_str), Some("pt"));

        let tensor = &header.tensors["model.embed_tokens.weight"];
        assert_eq!(tensor.dtype, "F16");
        assert_eq!(tensor.shape, vec![32000, 4096]);
        assert_eq!(tensor.data_offsets, (0, 262144000));
    }

    #[test]
    fn test_header_len_past_eof() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1000u64.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        let err = parse(bytes.as_slice(), bytes.len() as u64).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn test_implausible_header_len() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        let err = parse(bytes.as_slice(), u64::MAX).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn test_invalid_json() {
        let bytes = encode("not json");
        let err = parse(bytes.as_slice(), bytes.len() as u64).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn test_reversed_offsets_rejected() {
        let json = r#"{"t": {"dtype": "F32", "shape": [1], "data_offsets": [10, 4]}}"#;
        let bytes = encode(json);
        let err = parse(bytes.as_slice(), bytes.len() as u64).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn test_dtypes_deduped() {
        let json = r#"{
            "a": {"dtype": "F16", "shape": [1], "data_offsets": [0, 2]},
            "b": {"dtype": "F16", "shape": [1], "data_offsets": [2, 4]},
            "c": {"dtype": "F32", "shape": [1], "data_offsets": [4, 8]}
        }"#;
        let bytes = encode(json);
        let header = parse(bytes.as_slice(), bytes.len() as u64).unwrap();
        assert_eq!(header.dtypes(), vec!["F16", "F32"]);
    }

    #[test]
    fn test_name_convention() {
        assert!(is_safetensors_name("model.safetensors"));
        assert!(is_safetensors_name("model-00001-of-00002.safetensors"));
        assert!(!is_safetensors_name("model.gguf"));
    }

    #[test]
    fn test_parse_file() {
        let json = r#"{"t": {"dtype": "F32", "shape": [2, 2], "data_offsets": [0, 16]}}"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&encode(json)).unwrap();
        // Data section would follow; the parser must not require it beyond the header.
        file.write_all(&[0u8; 16]).unwrap();
        file.flush().unwrap();

        let header = parse_file(file.path()).unwrap();
        assert_eq!(header.tensor_count(), 1);
    }
}
