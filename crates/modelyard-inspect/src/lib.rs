//! Modelyard Inspect - header-only decoders for model file formats.
//!
//! Parses just enough of a model file to validate it and describe it:
//! - GGUF: magic, version, typed metadata key/value table, tensor-info table
//! - Safetensors: length-prefixed JSON header
//!
//! Tensor *data* is never read; parsing stops at the end of the header. All
//! decoders are stateless pure functions over a byte stream, so they can run
//! against a partially downloaded file as long as the header is complete.

pub mod endian;
pub mod error;
pub mod gguf;
pub mod safetensors;

pub use endian::ByteOrder;
pub use error::ParseError;
pub use gguf::{GgufHeader, GgufValue, TensorInfo};
pub use safetensors::SafetensorsHeader;

use std::io::Read;
use std::path::Path;

/// Model file formats the inspectors understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Gguf,
    Safetensors,
    Unknown,
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileFormat::Gguf => write!(f, "GGUF"),
            FileFormat::Safetensors => write!(f, "safetensors"),
            FileFormat::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detect the file format from the leading bytes of `path`.
///
/// GGUF is identified by its magic (either byte order); safetensors by a
/// plausible little-endian header length followed by a JSON opening brace.
pub fn detect_format(path: impl AsRef<Path>) -> std::io::Result<FileFormat> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut header = [0u8; 16];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }

    Ok(sniff_format(&header[..read]))
}

/// Classify leading file bytes without touching the filesystem.
pub fn sniff_format(header: &[u8]) -> FileFormat {
    if header.len() >= 4 && (header[..4] == *gguf::MAGIC_LE || header[..4] == *gguf::MAGIC_BE) {
        return FileFormat::Gguf;
    }

    if header.len() >= 9 {
        let header_size = u64::from_le_bytes(header[..8].try_into().unwrap_or([0; 8]));
        if header_size > 0 && header_size < safetensors::MAX_HEADER_LEN && header[8] == b'{' {
            return FileFormat::Safetensors;
        }
    }

    FileFormat::Unknown
}
