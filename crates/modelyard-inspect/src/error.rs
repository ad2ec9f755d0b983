//! Error types for header parsing.

use thiserror::Error;

/// Errors produced while decoding a model file header.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The header is truncated, self-inconsistent, or declares lengths that
    /// would read past its own bounds.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The file does not carry the expected magic bytes.
    #[error("not a {expected} file: invalid magic bytes")]
    BadMagic { expected: &'static str },

    /// The format version is not one this decoder understands.
    #[error("unsupported {format} version {found}")]
    UnsupportedVersion { format: &'static str, found: u32 },

    #[error("I/O error while reading header: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        // A read hitting EOF mid-field means the header lied about its size.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ParseError::MalformedHeader("unexpected end of data inside header".to_string())
        } else {
            ParseError::Io(err)
        }
    }
}

/// Result type alias for parse operations.
pub type Result<T> = std::result::Result<T, ParseError>;
