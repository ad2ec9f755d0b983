//! Ref files: persisted records binding a model identity to its blobs.
//!
//! A ref file is written only after every blob it names is present and
//! verified, and always via temp-file + atomic rename, so readers never see
//! a half-written record and a partial pull leaves no ref behind.

use crate::digest;
use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::store::StoreLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// What a blob is to the model it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobRole {
    /// The registry manifest the model was resolved from.
    Manifest,
    /// Registry config object.
    Config,
    /// An opaque registry layer.
    Layer,
    /// A named model file (weights, templates, tokenizer data).
    File,
}

/// One blob entry of a ref file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefBlob {
    /// `sha256:<hex>` digest.
    pub digest: String,
    pub size: u64,
    pub role: BlobRole,
    /// Name the blob takes inside the snapshot directory.
    pub logical_path: String,
    /// For `file://` models: the local source the blob refers to instead of
    /// a stored copy.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_path: Option<PathBuf>,
    /// Modification time of `source_path` at ingest, for staleness checks.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_mtime_unix: Option<i64>,
}

impl RefBlob {
    pub fn new(digest_hex: &str, size: u64, role: BlobRole, logical_path: impl Into<String>) -> Self {
        Self {
            digest: digest::with_prefix(digest_hex),
            size,
            role,
            logical_path: logical_path.into(),
            source_path: None,
            source_mtime_unix: None,
        }
    }

    /// Bare hex form of the digest.
    pub fn digest_hex(&self) -> &str {
        digest::strip_prefix(&self.digest)
    }

    pub fn is_model_file(&self) -> bool {
        self.role == BlobRole::File
            && (self.logical_path.ends_with(".gguf")
                || self.logical_path.ends_with(".safetensors")
                || self.logical_path == "model.file")
    }
}

/// The persisted record for one pulled model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefFile {
    pub identifier: ModelIdentifier,
    pub transport: TransportKind,
    pub created_at: DateTime<Utc>,
    pub blobs: Vec<RefBlob>,
    pub verified: bool,
}

impl RefFile {
    pub fn new(identifier: ModelIdentifier, blobs: Vec<RefBlob>, verified: bool) -> Self {
        let transport = identifier.transport;
        Self {
            identifier,
            transport,
            created_at: Utc::now(),
            blobs,
            verified,
        }
    }

    /// Blobs that are model files (weights or derived model content).
    pub fn model_files(&self) -> impl Iterator<Item = &RefBlob> {
        self.blobs.iter().filter(|b| b.is_model_file())
    }

    pub fn find(&self, logical_path: &str) -> Option<&RefBlob> {
        self.blobs.iter().find(|b| b.logical_path == logical_path)
    }

    pub fn total_size(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }

    pub fn references_digest(&self, digest_hex: &str) -> bool {
        let digest_hex = digest::strip_prefix(digest_hex);
        self.blobs.iter().any(|b| b.digest_hex() == digest_hex)
    }
}

/// Reads and writes ref files under `refs/`.
#[derive(Debug, Clone)]
pub struct RefStore {
    layout: StoreLayout,
}

impl RefStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn exists(&self, id: &ModelIdentifier) -> bool {
        self.layout.ref_path(id).is_file()
    }

    /// Serialize atomically: temp file in the target directory, validate by
    /// re-parsing, then rename over the final path.
    pub fn write(&self, ref_file: &RefFile) -> Result<()> {
        let path = self.layout.ref_path(&ref_file.identifier);
        let dir = self.layout.ref_dir(&ref_file.identifier);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io_with_path(e, dir.clone()))?;

        let serialized = serde_json::to_string_pretty(ref_file)?;
        serde_json::from_str::<RefFile>(&serialized)?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| StoreError::io_with_path(e, dir))?;
        temp.write_all(serialized.as_bytes())
            .map_err(|e| StoreError::io_with_path(e, temp.path()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io_with_path(e, temp.path()))?;
        temp.persist(&path)
            .map_err(|e| StoreError::io_with_path(e.error, path.clone()))?;

        debug!("Wrote ref {}", path.display());
        Ok(())
    }

    pub fn read(&self, id: &ModelIdentifier) -> Result<RefFile> {
        let path = self.layout.ref_path(id);
        if !path.is_file() {
            return Err(StoreError::RefNotFound(id.to_string()));
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| StoreError::io_with_path(e, path))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete the ref file, returning the removed record for GC scoping.
    pub fn remove(&self, id: &ModelIdentifier) -> Result<RefFile> {
        let removed = self.read(id)?;
        let path = self.layout.ref_path(id);
        std::fs::remove_file(&path).map_err(|e| StoreError::io_with_path(e, path))?;
        debug!("Removed ref for {id}");
        Ok(removed)
    }

    /// All refs, most recently modified first. Unparsable files are skipped
    /// with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<RefFile>> {
        let refs_dir = self.layout.refs_dir();
        let mut entries: Vec<(std::time::SystemTime, RefFile)> = Vec::new();
        if !refs_dir.is_dir() {
            return Ok(Vec::new());
        }

        for entry in walkdir::WalkDir::new(&refs_dir) {
            let entry = entry.map_err(|e| StoreError::Io {
                message: e.to_string(),
                path: Some(refs_dir.clone()),
                source: None,
            })?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }

            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping unreadable ref {}: {e}", entry.path().display());
                    continue;
                }
            };
            match serde_json::from_str::<RefFile>(&content) {
                Ok(ref_file) => {
                    let modified = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    entries.push((modified, ref_file));
                }
                Err(e) => warn!("Skipping malformed ref {}: {e}", entry.path().display()),
            }
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, r)| r).collect())
    }

    /// How many refs reference the given blob digest.
    pub fn count_references(&self, digest_hex: &str) -> Result<usize> {
        Ok(self
            .list()?
            .iter()
            .filter(|r| r.references_digest(digest_hex))
            .count())
    }

    /// Every digest referenced by any ref, as bare hex.
    pub fn referenced_digests(&self) -> Result<HashSet<String>> {
        let mut digests = HashSet::new();
        for ref_file in self.list()? {
            for blob in &ref_file.blobs {
                digests.insert(blob.digest_hex().to_string());
            }
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{parse, TransportKind};
    use tempfile::TempDir;

    fn ref_store() -> (TempDir, RefStore) {
        let tmp = TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        (tmp, RefStore::new(layout))
    }

    fn sample_ref(model: &str) -> RefFile {
        let id = parse(model, TransportKind::Ollama).unwrap();
        RefFile::new(
            id,
            vec![
                RefBlob::new("aa00", 100, BlobRole::File, "model.file"),
                RefBlob::new("bb11", 5, BlobRole::Config, "config.json"),
            ],
            true,
        )
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_tmp, refs) = ref_store();
        let original = sample_ref("ollama://tinyllama");
        refs.write(&original).unwrap();

        let read_back = refs.read(&original.identifier).unwrap();
        assert_eq!(read_back, original);
    }

    #[test]
    fn test_read_missing_is_ref_not_found() {
        let (_tmp, refs) = ref_store();
        let id = parse("ollama://absent", TransportKind::Ollama).unwrap();
        assert!(matches!(refs.read(&id), Err(StoreError::RefNotFound(_))));
    }

    #[test]
    fn test_write_replaces_not_merges() {
        let (_tmp, refs) = ref_store();
        let mut ref_file = sample_ref("ollama://tinyllama");
        refs.write(&ref_file).unwrap();

        ref_file.blobs = vec![RefBlob::new("cc22", 7, BlobRole::File, "model.file")];
        refs.write(&ref_file).unwrap();

        let read_back = refs.read(&ref_file.identifier).unwrap();
        assert_eq!(read_back.blobs.len(), 1);
        assert_eq!(read_back.blobs[0].digest, "sha256:cc22");
    }

    #[test]
    fn test_json_schema_shape() {
        let ref_file = sample_ref("ollama://tinyllama");
        let json = serde_json::to_value(&ref_file).unwrap();
        assert_eq!(json["transport"], "hub");
        assert_eq!(json["blobs"][0]["digest"], "sha256:aa00");
        assert_eq!(json["blobs"][0]["role"], "file");
        assert_eq!(json["blobs"][0]["logical_path"], "model.file");
        assert_eq!(json["verified"], true);
        assert!(json["created_at"].as_str().unwrap().contains('T'));
        // optional source fields stay absent for stored blobs
        assert!(json["blobs"][0].get("source_path").is_none());
    }

    #[test]
    fn test_ref_lands_at_stable_path() {
        let (tmp, refs) = ref_store();
        refs.write(&sample_ref("ollama://tinyllama")).unwrap();
        assert!(tmp
            .path()
            .join("refs/hub/library/tinyllama/latest.json")
            .is_file());
    }

    #[test]
    fn test_list_skips_malformed() {
        let (tmp, refs) = ref_store();
        refs.write(&sample_ref("ollama://good")).unwrap();

        let junk_dir = tmp.path().join("refs/hub/library/bad");
        std::fs::create_dir_all(&junk_dir).unwrap();
        std::fs::write(junk_dir.join("latest.json"), "{ not json").unwrap();

        let listed = refs.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier.name, "good");
    }

    #[test]
    fn test_reference_counting() {
        let (_tmp, refs) = ref_store();
        refs.write(&sample_ref("ollama://one")).unwrap();
        refs.write(&sample_ref("ollama://two")).unwrap();

        assert_eq!(refs.count_references("aa00").unwrap(), 2);
        assert_eq!(refs.count_references("sha256:bb11").unwrap(), 2);
        assert_eq!(refs.count_references("ffff").unwrap(), 0);

        let digests = refs.referenced_digests().unwrap();
        assert!(digests.contains("aa00"));
        assert!(digests.contains("bb11"));
    }

    #[test]
    fn test_remove_returns_record() {
        let (_tmp, refs) = ref_store();
        let ref_file = sample_ref("ollama://gone");
        refs.write(&ref_file).unwrap();

        let removed = refs.remove(&ref_file.identifier).unwrap();
        assert_eq!(removed.blobs.len(), 2);
        assert!(!refs.exists(&ref_file.identifier));
        assert!(matches!(
            refs.remove(&ref_file.identifier),
            Err(StoreError::RefNotFound(_))
        ));
    }
}
