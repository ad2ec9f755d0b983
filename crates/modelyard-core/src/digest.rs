//! Streaming sha256 helpers.
//!
//! The store's blob identity is a lowercase sha256 hex string. Files are
//! hashed in 8MB chunks; async callers hop onto a blocking task since file
//! hashing is CPU/IO bound.

use crate::error::{Result, StoreError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files (8MB, optimal for SSDs).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Digest-string prefix used in manifests and RefFiles.
pub const SHA256_PREFIX: &str = "sha256:";

/// Strip an optional `sha256:` prefix, leaving the bare hex.
pub fn strip_prefix(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Prepend the `sha256:` prefix to bare hex.
pub fn with_prefix(hex_digest: &str) -> String {
    if hex_digest.starts_with(SHA256_PREFIX) {
        hex_digest.to_string()
    } else {
        format!("{SHA256_PREFIX}{hex_digest}")
    }
}

/// Hash an in-memory byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a file's full contents, streaming.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| StoreError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| StoreError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on a blocking task.
pub async fn hash_file_async(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || hash_file(&task_path))
        .await
        .map_err(|e| StoreError::Io {
            message: format!("hash task failed: {e}"),
            path: Some(path),
            source: None,
        })?
}

/// Re-hash a file and compare against `expected` (bare hex or prefixed).
///
/// Returns `DigestMismatch` on divergence so callers can discard content.
pub fn verify_file(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let expected = strip_prefix(expected).to_lowercase();
    let actual = hash_file(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(StoreError::DigestMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_hash_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), EMPTY_SHA256);
    }

    #[test]
    fn test_hash_bytes_matches_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"model bytes").unwrap();
        file.flush().unwrap();

        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(b"model bytes"));
    }

    #[test]
    fn test_prefix_handling() {
        assert_eq!(strip_prefix("sha256:abc"), "abc");
        assert_eq!(strip_prefix("abc"), "abc");
        assert_eq!(with_prefix("abc"), "sha256:abc");
        assert_eq!(with_prefix("sha256:abc"), "sha256:abc");
    }

    #[test]
    fn test_verify_accepts_both_forms() {
        let file = NamedTempFile::new().unwrap();
        assert!(verify_file(file.path(), EMPTY_SHA256).is_ok());
        assert!(verify_file(file.path(), &with_prefix(EMPTY_SHA256)).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        file.flush().unwrap();

        let err = verify_file(file.path(), EMPTY_SHA256).unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"async bytes").unwrap();
        file.flush().unwrap();

        let digest = hash_file_async(file.path()).await.unwrap();
        assert_eq!(digest, hash_bytes(b"async bytes"));
    }
}
