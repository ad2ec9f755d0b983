//! Error types for the model store.
//!
//! One enum covers the whole store surface. Transport-level network errors
//! are the only retryable kind; everything else propagates to the facade,
//! which surfaces a single message plus a stable [`ErrorKind`] for the CLI
//! collaborator's exit-code mapping.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    // Network errors (retryable at the transport layer)
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The identifier could not be resolved upstream. Fatal, never retried.
    #[error("Model not found: {0}")]
    NotFound(String),

    /// Downloaded content did not match its declared digest. The content is
    /// discarded and never written under the claimed digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A GGUF or safetensors header failed validation.
    #[error("Malformed model file header: {0}")]
    MalformedHeader(#[from] modelyard_inspect::ParseError),

    /// Delete attempted on a blob still referenced by a ref file.
    #[error("Blob {digest} is referenced by {ref_count} ref(s) and cannot be deleted")]
    BlobInUse { digest: String, ref_count: usize },

    #[error("No ref file found for '{0}'; pull the model first")]
    RefNotFound(String),

    /// Every strategy in the delivery chain was probed and rejected.
    #[error("No viable transport strategy for '{reference}': {tried}")]
    NoViableTransport { reference: String, tried: String },

    #[error("Unsupported media type '{0}' in manifest")]
    UnsupportedMediaType(String),

    /// Definitive HTTP failure (auth, client error); not retried.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A pulled model's byte order does not match the host.
    #[error("Model byte order ({model}) does not match host ({host})")]
    EndianMismatch { host: String, model: String },

    #[error("Invalid model reference '{reference}': {reason}")]
    InvalidIdentifier { reference: String, reason: String },

    /// A manifest declared a file path that would escape the snapshot dir.
    #[error("Unsafe logical path '{0}' in manifest")]
    UnsafeLogicalPath(String),

    // Ambient errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Failed to create symlink from {src} to {dest}: {reason}")]
    SymlinkFailed {
        src: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Import rejected: {0}")]
    ImportRejected(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Stable, coarse error classification surfaced to the CLI collaborator for
/// exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    NotFound,
    Integrity,
    Usage,
    Internal,
}

// Conversion implementations for common error types

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.status().map(|s| s == reqwest::StatusCode::NOT_FOUND) == Some(true) {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl StoreError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        StoreError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry at the transport layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Network { .. } | StoreError::Timeout(_))
    }

    /// Stable classification for the CLI collaborator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Network { .. } | StoreError::Timeout(_) => ErrorKind::Network,

            StoreError::NotFound(_) | StoreError::RefNotFound(_) => ErrorKind::NotFound,

            StoreError::DigestMismatch { .. }
            | StoreError::MalformedHeader(_)
            | StoreError::EndianMismatch { .. }
            | StoreError::UnsafeLogicalPath(_)
            | StoreError::ImportRejected(_) => ErrorKind::Integrity,

            StoreError::BlobInUse { .. }
            | StoreError::NoViableTransport { .. }
            | StoreError::UnsupportedMediaType(_)
            | StoreError::InvalidIdentifier { .. }
            | StoreError::Http { .. }
            | StoreError::Config { .. } => ErrorKind::Usage,

            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::DigestMismatch {
            expected: "abc".into(),
            actual: "def".into(),
        };
        assert_eq!(err.to_string(), "Digest mismatch: expected abc, got def");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StoreError::Network {
            message: "connection reset".into(),
            source: None
        }
        .is_retryable());
        assert!(StoreError::Timeout("deadline".into()).is_retryable());
        assert!(!StoreError::NotFound("gone".into()).is_retryable());
        assert!(!StoreError::DigestMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StoreError::RefNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            StoreError::BlobInUse {
                digest: "d".into(),
                ref_count: 2
            }
            .kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            StoreError::DigestMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = StoreError::from(io_err);
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
