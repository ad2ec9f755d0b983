//! Snapshot materialization.
//!
//! A snapshot is the consumable view of a model: a directory of symlinks
//! into `blobs/`, named by each blob's logical path. Snapshots are derived
//! state: always rebuildable from a ref file plus the blob store, safe to
//! delete, and refreshed idempotently.

use crate::error::{Result, StoreError};
use crate::identifier::ModelIdentifier;
use crate::store::blob::BlobStore;
use crate::store::refs::RefFile;
use crate::store::StoreLayout;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Builds and removes snapshot directories.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    layout: StoreLayout,
}

impl SnapshotStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn dir(&self, id: &ModelIdentifier) -> PathBuf {
        self.layout.snapshot_dir(id)
    }

    /// Create or refresh the snapshot for `ref_file`.
    ///
    /// Stored blobs get relative links into `blobs/`; `file://` reference
    /// blobs link straight to their local source. Existing links are
    /// re-pointed, so rebuilding is idempotent.
    pub fn build(&self, ref_file: &RefFile, blobs: &BlobStore) -> Result<PathBuf> {
        let snapshot_dir = self.dir(&ref_file.identifier);
        std::fs::create_dir_all(&snapshot_dir)
            .map_err(|e| StoreError::io_with_path(e, snapshot_dir.clone()))?;

        for blob in &ref_file.blobs {
            let link_path = safe_join(&snapshot_dir, &blob.logical_path)?;
            if let Some(parent) = link_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io_with_path(e, parent.to_path_buf()))?;
            }

            let target = match &blob.source_path {
                Some(source) => source.clone(),
                None => {
                    let blob_path = blobs.path(blob.digest_hex());
                    relative_from_dir(&blob_path, link_path.parent().unwrap_or(&snapshot_dir))
                }
            };

            replace_symlink(&target, &link_path)?;
        }

        debug!(
            "Snapshot for {} materialized at {}",
            ref_file.identifier,
            snapshot_dir.display()
        );
        Ok(snapshot_dir)
    }

    /// Delete the snapshot directory; missing is fine.
    pub fn remove(&self, id: &ModelIdentifier) -> Result<()> {
        let dir = self.dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io_with_path(e, dir)),
        }
    }

    /// Check that every entry of the snapshot resolves to real content.
    pub fn verify(&self, ref_file: &RefFile) -> Result<bool> {
        let snapshot_dir = self.dir(&ref_file.identifier);
        for blob in &ref_file.blobs {
            let link_path = safe_join(&snapshot_dir, &blob.logical_path)?;
            match std::fs::metadata(&link_path) {
                Ok(_) => {}
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Join `logical_path` under `base`, rejecting anything that would escape.
fn safe_join(base: &Path, logical_path: &str) -> Result<PathBuf> {
    let relative = Path::new(logical_path);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StoreError::UnsafeLogicalPath(logical_path.to_string())),
        }
    }
    if logical_path.is_empty() {
        return Err(StoreError::UnsafeLogicalPath(logical_path.to_string()));
    }
    Ok(base.join(relative))
}

/// Relative path from `from_dir` to `target`, both absolute-or-rooted the
/// same way (they share the store root).
fn relative_from_dir(target: &Path, from_dir: &Path) -> PathBuf {
    let target_parts: Vec<_> = target.components().collect();
    let from_parts: Vec<_> = from_dir.components().collect();

    let common = target_parts
        .iter()
        .zip(from_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..from_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    relative
}

/// Create the symlink, replacing an existing entry at the link path.
fn replace_symlink(target: &Path, link_path: &Path) -> Result<()> {
    if link_path.symlink_metadata().is_ok() {
        std::fs::remove_file(link_path)
            .map_err(|e| StoreError::io_with_path(e, link_path.to_path_buf()))?;
    }

    symlink(target, link_path).map_err(|e| StoreError::SymlinkFailed {
        src: target.to_path_buf(),
        dest: link_path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{parse, TransportKind};
    use crate::store::refs::{BlobRole, RefBlob};
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore, SnapshotStore) {
        let tmp = TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        (
            tmp,
            BlobStore::new(layout.clone()),
            SnapshotStore::new(layout),
        )
    }

    fn ref_with_blob(model: &str, blobs: &BlobStore, content: &[u8]) -> RefFile {
        let blob = blobs.put_bytes(content).unwrap();
        let id = parse(model, TransportKind::Ollama).unwrap();
        RefFile::new(
            id,
            vec![RefBlob::new(
                &blob.digest,
                blob.size,
                BlobRole::File,
                "model.file",
            )],
            true,
        )
    }

    #[test]
    fn test_build_resolves_through_link() {
        let (_tmp, blobs, snapshots) = store();
        let ref_file = ref_with_blob("ollama://tinyllama", &blobs, b"weights");

        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        let entry = dir.join("model.file");
        assert!(entry.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&entry).unwrap(), b"weights");
        assert!(snapshots.verify(&ref_file).unwrap());
    }

    #[test]
    fn test_build_is_idempotent() {
        let (_tmp, blobs, snapshots) = store();
        let ref_file = ref_with_blob("ollama://tinyllama", &blobs, b"weights");

        snapshots.build(&ref_file, &blobs).unwrap();
        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        assert_eq!(std::fs::read(dir.join("model.file")).unwrap(), b"weights");
    }

    #[test]
    fn test_nested_logical_path() {
        let (_tmp, blobs, snapshots) = store();
        let blob = blobs.put_bytes(b"shard").unwrap();
        let id = parse("hf://org/repo", TransportKind::Ollama).unwrap();
        let ref_file = RefFile::new(
            id,
            vec![RefBlob::new(
                &blob.digest,
                blob.size,
                BlobRole::File,
                "shards/part-00001.gguf",
            )],
            true,
        );

        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        assert_eq!(
            std::fs::read(dir.join("shards/part-00001.gguf")).unwrap(),
            b"shard"
        );
    }

    #[test]
    fn test_escaping_logical_path_rejected() {
        let (_tmp, blobs, snapshots) = store();
        let blob = blobs.put_bytes(b"x").unwrap();
        let id = parse("hf://org/repo", TransportKind::Ollama).unwrap();
        let ref_file = RefFile::new(
            id,
            vec![RefBlob::new(
                &blob.digest,
                blob.size,
                BlobRole::File,
                "../escape",
            )],
            true,
        );

        let err = snapshots.build(&ref_file, &blobs).unwrap_err();
        assert!(matches!(err, StoreError::UnsafeLogicalPath(_)));
    }

    #[test]
    fn test_remove_then_rebuild() {
        let (_tmp, blobs, snapshots) = store();
        let ref_file = ref_with_blob("ollama://tinyllama", &blobs, b"weights");

        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        snapshots.remove(&ref_file.identifier).unwrap();
        assert!(!dir.exists());

        // Derived state: rebuild restores the identical view.
        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        assert_eq!(std::fs::read(dir.join("model.file")).unwrap(), b"weights");
    }

    #[test]
    fn test_source_path_links_to_local_file() {
        let (tmp, blobs, snapshots) = store();
        let source = tmp.path().join("local.gguf");
        std::fs::write(&source, b"local model").unwrap();

        let id = parse("file:///local.gguf", TransportKind::Ollama).unwrap();
        let mut blob = RefBlob::new("ab12", 11, BlobRole::File, "local.gguf");
        blob.source_path = Some(source.clone());
        blob.source_mtime_unix = Some(0);
        let ref_file = RefFile::new(id, vec![blob], false);

        let dir = snapshots.build(&ref_file, &blobs).unwrap();
        assert_eq!(std::fs::read(dir.join("local.gguf")).unwrap(), b"local model");
        assert_eq!(std::fs::read_link(dir.join("local.gguf")).unwrap(), source);
    }

    #[test]
    fn test_relative_from_dir() {
        let rel = relative_from_dir(
            Path::new("/store/blobs/sha256/ab/abcd"),
            Path::new("/store/snapshots/hub/library/tiny/latest"),
        );
        assert_eq!(rel, PathBuf::from("../../../../../blobs/sha256/ab/abcd"));
    }
}
