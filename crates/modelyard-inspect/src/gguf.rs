//! GGUF header parsing.
//!
//! Decodes the GGUF container header: magic, version, the typed metadata
//! key/value table, and the tensor-info table. Reads stop at the end of the
//! tensor table; tensor data is never touched. Layout reference:
//! <https://github.com/ggml-org/ggml/blob/master/docs/gguf.md#file-structure>

use crate::endian::ByteOrder;
use crate::error::{ParseError, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::Path;

/// Magic bytes of a little-endian GGUF file.
pub const MAGIC_LE: &[u8; 4] = b"GGUF";
/// Byte-reversed magic marking a big-endian file. The magic is the only
/// endianness signal in the format.
pub const MAGIC_BE: &[u8; 4] = b"FUGG";

const SUPPORTED_VERSIONS: &[u32] = &[2, 3];

// Hostile-header guards. Real models stay far below these; anything above
// means the header is lying about its own size.
const MAX_METADATA_ENTRIES: u64 = 1 << 20;
const MAX_TENSORS: u64 = 1 << 24;
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;
const MAX_ARRAY_LEN: u64 = 1 << 26;
const MAX_DIMENSIONS: u32 = 8;

/// Metadata value types, by wire discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl ValueType {
    fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::String,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            other => {
                return Err(ParseError::MalformedHeader(format!(
                    "unknown metadata value type {other}"
                )))
            }
        })
    }
}

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// String payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload widened to u64, if non-negative integral.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::U8(v) => Some(u64::from(*v)),
            GgufValue::U16(v) => Some(u64::from(*v)),
            GgufValue::U32(v) => Some(u64::from(*v)),
            GgufValue::U64(v) => Some(*v),
            GgufValue::I8(v) if *v >= 0 => Some(*v as u64),
            GgufValue::I16(v) if *v >= 0 => Some(*v as u64),
            GgufValue::I32(v) if *v >= 0 => Some(*v as u64),
            GgufValue::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Convert to a JSON value for display/serialization.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            GgufValue::U8(v) => json!(v),
            GgufValue::I8(v) => json!(v),
            GgufValue::U16(v) => json!(v),
            GgufValue::I16(v) => json!(v),
            GgufValue::U32(v) => json!(v),
            GgufValue::I32(v) => json!(v),
            GgufValue::F32(v) => json!(v),
            GgufValue::Bool(v) => json!(v),
            GgufValue::String(v) => json!(v),
            GgufValue::Array(vs) => {
                serde_json::Value::Array(vs.iter().map(GgufValue::to_json).collect())
            }
            GgufValue::U64(v) => json!(v),
            GgufValue::I64(v) => json!(v),
            GgufValue::F64(v) => json!(v),
        }
    }
}

/// One entry of the tensor-info table.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub n_dimensions: u32,
    pub dimensions: Vec<u64>,
    /// Raw ggml tensor type discriminant.
    pub ggml_type: u32,
    /// Offset of the tensor data, relative to the start of the data section.
    pub offset: u64,
}

/// A fully decoded GGUF header.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub byte_order: ByteOrder,
    pub tensor_count: u64,
    pub metadata: BTreeMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
}

impl GgufHeader {
    /// Look up a metadata value by key.
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    /// `general.architecture`, when present.
    pub fn architecture(&self) -> Option<&str> {
        self.get("general.architecture").and_then(GgufValue::as_str)
    }

    /// `general.name`, when present.
    pub fn model_name(&self) -> Option<&str> {
        self.get("general.name").and_then(GgufValue::as_str)
    }

    /// Embedded chat template, when present. The tokenizer-scoped key is the
    /// common spelling; a bare `chat_template` appears in older files.
    pub fn chat_template(&self) -> Option<&str> {
        ["tokenizer.chat_template", "chat_template"]
            .iter()
            .find_map(|key| self.get(key).and_then(GgufValue::as_str))
    }

    /// Metadata as a JSON object, keys sorted.
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Check whether `path` starts with a GGUF magic (either byte order).
pub fn is_gguf(path: impl AsRef<Path>) -> bool {
    let mut magic = [0u8; 4];
    match std::fs::File::open(path.as_ref()) {
        Ok(mut file) => {
            file.read_exact(&mut magic).is_ok() && (magic == *MAGIC_LE || magic == *MAGIC_BE)
        }
        Err(_) => false,
    }
}

/// Read only the magic to determine the file's byte order.
pub fn byte_order(path: impl AsRef<Path>) -> Result<ByteOrder> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    match &magic {
        m if m == MAGIC_LE => Ok(ByteOrder::Little),
        m if m == MAGIC_BE => Ok(ByteOrder::Big),
        _ => Err(ParseError::BadMagic { expected: "GGUF" }),
    }
}

/// Parse the header of the GGUF file at `path`.
pub fn parse_file(path: impl AsRef<Path>) -> Result<GgufHeader> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let budget = file.metadata()?.len();
    parse(BufReader::new(file), budget)
}

/// Parse a GGUF header from `reader`.
///
/// `budget` is the total number of bytes available (typically the file
/// size); any declared length that would read past it fails with
/// `MalformedHeader` before the read is attempted.
pub fn parse<R: Read>(reader: R, budget: u64) -> Result<GgufHeader> {
    let mut r = HeaderReader::new(reader, budget);

    let mut magic = [0u8; 4];
    r.read_bytes(&mut magic)?;
    let byte_order = match &magic {
        m if m == MAGIC_LE => ByteOrder::Little,
        m if m == MAGIC_BE => ByteOrder::Big,
        _ => return Err(ParseError::BadMagic { expected: "GGUF" }),
    };
    r.order = byte_order;

    let version = r.read_u32()?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ParseError::UnsupportedVersion {
            format: "GGUF",
            found: version,
        });
    }

    let tensor_count = r.read_u64()?;
    if tensor_count > MAX_TENSORS {
        return Err(ParseError::MalformedHeader(format!(
            "implausible tensor count {tensor_count}"
        )));
    }
    let metadata_kv_count = r.read_u64()?;
    if metadata_kv_count > MAX_METADATA_ENTRIES {
        return Err(ParseError::MalformedHeader(format!(
            "implausible metadata entry count {metadata_kv_count}"
        )));
    }

    let mut metadata = BTreeMap::new();
    for _ in 0..metadata_kv_count {
        let key = r.read_string()?;
        let value_type = ValueType::from_wire(r.read_u32()?)?;
        let value = r.read_value(value_type)?;
        metadata.insert(key, value);
    }

    let mut tensors = Vec::with_capacity(tensor_count.min(1024) as usize);
    for _ in 0..tensor_count {
        let name = r.read_string()?;
        let n_dimensions = r.read_u32()?;
        if n_dimensions > MAX_DIMENSIONS {
            return Err(ParseError::MalformedHeader(format!(
                "tensor '{name}' declares {n_dimensions} dimensions"
            )));
        }
        let mut dimensions = Vec::with_capacity(n_dimensions as usize);
        for _ in 0..n_dimensions {
            dimensions.push(r.read_u64()?);
        }
        let ggml_type = r.read_u32()?;
        let offset = r.read_u64()?;
        tensors.push(TensorInfo {
            name,
            n_dimensions,
            dimensions,
            ggml_type,
            offset,
        });
    }

    Ok(GgufHeader {
        version,
        byte_order,
        tensor_count,
        metadata,
        tensors,
    })
}

/// Byte-order-aware bounded reader over the header bytes.
struct HeaderReader<R> {
    inner: R,
    order: ByteOrder,
    remaining: u64,
}

impl<R: Read> HeaderReader<R> {
    fn new(inner: R, budget: u64) -> Self {
        Self {
            inner,
            order: ByteOrder::Little,
            remaining: budget,
        }
    }

    fn claim(&mut self, len: u64) -> Result<()> {
        if len > self.remaining {
            return Err(ParseError::MalformedHeader(format!(
                "declared length {len} exceeds {} remaining header bytes",
                self.remaining
            )));
        }
        self.remaining -= len;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.claim(buf.len() as u64)?;
        self.inner.read_exact(buf)?;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(buf),
            ByteOrder::Big => u16::from_be_bytes(buf),
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(buf),
            ByteOrder::Big => u32::from_be_bytes(buf),
        })
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(buf),
            ByteOrder::Big => u64::from_be_bytes(buf),
        })
    }

    fn read_bool(&mut self) -> Result<bool> {
        // 0 is false, 1 is true; anything else marks an invalid file.
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ParseError::MalformedHeader(format!(
                "invalid bool value {other}"
            ))),
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()?;
        if len > MAX_STRING_LEN {
            return Err(ParseError::MalformedHeader(format!(
                "implausible string length {len}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| ParseError::MalformedHeader("string is not valid UTF-8".to_string()))
    }

    fn read_value(&mut self, value_type: ValueType) -> Result<GgufValue> {
        Ok(match value_type {
            ValueType::U8 => GgufValue::U8(self.read_u8()?),
            ValueType::I8 => GgufValue::I8(self.read_u8()? as i8),
            ValueType::U16 => GgufValue::U16(self.read_u16()?),
            ValueType::I16 => GgufValue::I16(self.read_u16()? as i16),
            ValueType::U32 => GgufValue::U32(self.read_u32()?),
            ValueType::I32 => GgufValue::I32(self.read_u32()? as i32),
            ValueType::F32 => GgufValue::F32(f32::from_bits(self.read_u32()?)),
            ValueType::Bool => GgufValue::Bool(self.read_bool()?),
            ValueType::String => GgufValue::String(self.read_string()?),
            ValueType::U64 => GgufValue::U64(self.read_u64()?),
            ValueType::I64 => GgufValue::I64(self.read_u64()? as i64),
            ValueType::F64 => GgufValue::F64(f64::from_bits(self.read_u64()?)),
            ValueType::Array => {
                let element_type = ValueType::from_wire(self.read_u32()?)?;
                let len = self.read_u64()?;
                if len > MAX_ARRAY_LEN {
                    return Err(ParseError::MalformedHeader(format!(
                        "implausible array length {len}"
                    )));
                }
                let mut values = Vec::with_capacity(len.min(4096) as usize);
                for _ in 0..len {
                    values.push(self.read_value(element_type)?);
                }
                GgufValue::Array(values)
            }
        })
    }
}
