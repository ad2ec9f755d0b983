//! Content-addressable blob storage.
//!
//! A blob's digest is both its identity and its integrity check. Writes go
//! to `tmp/` while hashing and only an atomic rename makes content visible
//! under `blobs/`, so no reader ever observes a partial blob.
//!
//! Two concurrent writers of the same content converge: whoever renames
//! second finds the blob already present and discards its own copy. Two
//! concurrent pulls of the *same* identifier may therefore both download;
//! that duplicate work is the accepted price of lock-free operation.

use crate::digest;
use crate::error::{Result, StoreError};
use crate::store::refs::RefStore;
use crate::store::StoreLayout;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// An immutable stored byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Bare lowercase sha256 hex.
    pub digest: String,
    pub size: u64,
    pub path: PathBuf,
}

/// The content-addressed half of the store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: StoreLayout,
}

impl BlobStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn has(&self, digest_hex: &str) -> bool {
        self.layout.blob_path(digest::strip_prefix(digest_hex)).is_file()
    }

    pub fn path(&self, digest_hex: &str) -> PathBuf {
        self.layout.blob_path(digest::strip_prefix(digest_hex))
    }

    pub fn size(&self, digest_hex: &str) -> Result<u64> {
        let path = self.path(digest_hex);
        let meta = std::fs::metadata(&path).map_err(|e| StoreError::io_with_path(e, path))?;
        Ok(meta.len())
    }

    /// Open a stored blob for reading.
    pub fn open(&self, digest_hex: &str) -> Result<std::fs::File> {
        let path = self.path(digest_hex);
        std::fs::File::open(&path).map_err(|e| StoreError::io_with_path(e, path))
    }

    /// Stream content into the store, hashing as it arrives.
    ///
    /// When `expected` carries a manifest-declared digest, a mismatch fails
    /// with `DigestMismatch` and the temp file is dropped; corrupt content
    /// is never renamed under its claimed digest.
    pub async fn put_stream<S>(&self, mut stream: S, expected: Option<&str>) -> Result<Blob>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut temp = self.new_temp()?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            temp.write_all(&chunk)
                .map_err(|e| StoreError::io_with_path(e, temp.path()))?;
            size += chunk.len() as u64;
        }
        temp.flush()
            .map_err(|e| StoreError::io_with_path(e, temp.path()))?;

        let digest_hex = hex::encode(hasher.finalize());
        self.commit_temp(temp, digest_hex, size, expected)
    }

    /// Store locally generated content (extracted templates, config stubs).
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Blob> {
        let mut temp = self.new_temp()?;
        temp.write_all(bytes)
            .map_err(|e| StoreError::io_with_path(e, temp.path()))?;
        temp.flush()
            .map_err(|e| StoreError::io_with_path(e, temp.path()))?;

        let digest_hex = digest::hash_bytes(bytes);
        self.commit_temp(temp, digest_hex, bytes.len() as u64, None)
    }

    /// Stable staging path for resumable downloads keyed by `key`
    /// (typically the expected digest). Lives under `tmp/`, never under
    /// `blobs/`.
    pub fn partial_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.layout.tmp_dir().join(format!("{safe}.partial"))
    }

    /// Promote a completed staging file into the store.
    ///
    /// Re-hashes the file, checks `expected` if given, then renames it to
    /// its final digest path (or discards it if the blob already exists).
    pub fn commit_partial(&self, partial: &std::path::Path, expected: Option<&str>) -> Result<Blob> {
        let digest_hex = digest::hash_file(partial)?;
        if let Some(expected) = expected {
            let expected = digest::strip_prefix(expected).to_lowercase();
            if digest_hex != expected {
                let _ = std::fs::remove_file(partial);
                return Err(StoreError::DigestMismatch {
                    expected,
                    actual: digest_hex,
                });
            }
        }

        let size = std::fs::metadata(partial)
            .map_err(|e| StoreError::io_with_path(e, partial))?
            .len();
        let final_path = self.layout.blob_path(&digest_hex);

        if final_path.is_file() {
            debug!("Blob {digest_hex} already present, discarding staged copy");
            let _ = std::fs::remove_file(partial);
        } else {
            self.prepare_parent(&final_path)?;
            std::fs::rename(partial, &final_path).or_else(|e| {
                // A concurrent writer may have won the rename; same content
                // either way.
                if final_path.is_file() {
                    let _ = std::fs::remove_file(partial);
                    Ok(())
                } else {
                    Err(StoreError::io_with_path(e, final_path.clone()))
                }
            })?;
            info!("Stored blob {digest_hex} ({size} bytes)");
        }

        Ok(Blob {
            digest: digest_hex,
            size,
            path: final_path,
        })
    }

    /// Re-hash a stored blob and compare with its digest.
    pub fn verify(&self, digest_hex: &str) -> Result<bool> {
        let digest_hex = digest::strip_prefix(digest_hex);
        let actual = digest::hash_file(self.path(digest_hex))?;
        Ok(actual == digest_hex.to_lowercase())
    }

    /// Delete a blob, refusing while any ref file still references it.
    pub fn delete(&self, digest_hex: &str, refs: &RefStore) -> Result<()> {
        let digest_hex = digest::strip_prefix(digest_hex);
        let ref_count = refs.count_references(digest_hex)?;
        if ref_count > 0 {
            return Err(StoreError::BlobInUse {
                digest: digest_hex.to_string(),
                ref_count,
            });
        }
        self.remove_unchecked(digest_hex)
    }

    /// All digests currently on disk.
    pub fn list_digests(&self) -> Result<Vec<String>> {
        let algo_dir = self.layout.blobs_dir().join("sha256");
        let mut digests = Vec::new();
        if !algo_dir.is_dir() {
            return Ok(digests);
        }
        for entry in walkdir::WalkDir::new(&algo_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| StoreError::Io {
                message: e.to_string(),
                path: Some(algo_dir.clone()),
                source: None,
            })?;
            if entry.file_type().is_file() {
                digests.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(digests)
    }

    pub(crate) fn remove_unchecked(&self, digest_hex: &str) -> Result<()> {
        let path = self.path(digest_hex);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed blob {digest_hex}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io_with_path(e, path)),
        }
    }

    fn new_temp(&self) -> Result<NamedTempFile> {
        let tmp_dir = self.layout.tmp_dir();
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| StoreError::io_with_path(e, tmp_dir.clone()))?;
        NamedTempFile::new_in(&tmp_dir).map_err(|e| StoreError::io_with_path(e, tmp_dir))
    }

    fn prepare_parent(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io_with_path(e, parent.to_path_buf()))?;
        }
        Ok(())
    }

    fn commit_temp(
        &self,
        temp: NamedTempFile,
        digest_hex: String,
        size: u64,
        expected: Option<&str>,
    ) -> Result<Blob> {
        if let Some(expected) = expected {
            let expected = digest::strip_prefix(expected).to_lowercase();
            if digest_hex != expected {
                // temp is dropped (and unlinked) here
                return Err(StoreError::DigestMismatch {
                    expected,
                    actual: digest_hex,
                });
            }
        }

        let final_path = self.layout.blob_path(&digest_hex);
        if final_path.is_file() {
            debug!("Blob {digest_hex} already present, discarding download");
        } else {
            self.prepare_parent(&final_path)?;
            match temp.persist(&final_path) {
                Ok(_) => info!("Stored blob {digest_hex} ({size} bytes)"),
                Err(e) if final_path.is_file() => {
                    debug!("Concurrent writer stored {digest_hex} first: {e}");
                }
                Err(e) => {
                    return Err(StoreError::io_with_path(e.error, final_path));
                }
            }
        }

        Ok(Blob {
            digest: digest_hex,
            size,
            path: final_path,
        })
    }
}
