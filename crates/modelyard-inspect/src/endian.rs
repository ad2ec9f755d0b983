//! Byte-order handling for GGUF files.
//!
//! GGUF files exist in little- and big-endian flavors; the magic bytes are
//! the only endianness signal. A model must match the host byte order to be
//! loadable by an inference runtime, so the store checks this at pull time.

use serde::{Deserialize, Serialize};

/// Byte order of a GGUF file or of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the machine this process runs on.
    pub fn host() -> Self {
        #[cfg(target_endian = "little")]
        {
            ByteOrder::Little
        }
        #[cfg(target_endian = "big")]
        {
            ByteOrder::Big
        }
    }

    pub fn is_little(self) -> bool {
        self == ByteOrder::Little
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little"),
            ByteOrder::Big => write!(f, "big"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matches_target_endian() {
        #[cfg(target_endian = "little")]
        assert_eq!(ByteOrder::host(), ByteOrder::Little);
        #[cfg(target_endian = "big")]
        assert_eq!(ByteOrder::host(), ByteOrder::Big);
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteOrder::Little.to_string(), "little");
        assert_eq!(ByteOrder::Big.to_string(), "big");
    }
}
