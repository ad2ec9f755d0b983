//! The on-disk model store.
//!
//! Three namespaces under one root, plus a staging area:
//!
//! ```text
//! <root>/blobs/sha256/<first-2-hex>/<digest>
//! <root>/refs/<transport>/<organization>/<name>/<reference>.json
//! <root>/snapshots/<transport>/<organization>/<name>/<reference>/<logical_path>
//! <root>/tmp/
//! ```
//!
//! `blobs/` holds immutable content addressed by digest; `refs/` binds model
//! identities to blob sets; `snapshots/` is a derived symlink view that can
//! always be rebuilt. Nothing under `tmp/` is reachable from `blobs/`, so an
//! interrupted write never leaves a partial blob visible.

pub mod archive;
pub mod blob;
pub mod gc;
pub mod refs;
pub mod snapshot;

use crate::error::{Result, StoreError};
use crate::identifier::ModelIdentifier;
use std::path::{Path, PathBuf};

const DIR_BLOBS: &str = "blobs";
const DIR_REFS: &str = "refs";
const DIR_SNAPSHOTS: &str = "snapshots";
const DIR_TMP: &str = "tmp";
const DIGEST_ALGO: &str = "sha256";

/// Path arithmetic for the store's namespaces.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(DIR_BLOBS)
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join(DIR_REFS)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(DIR_SNAPSHOTS)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(DIR_TMP)
    }

    /// Final resting place of a blob, keyed by bare hex digest.
    pub fn blob_path(&self, digest_hex: &str) -> PathBuf {
        let prefix = &digest_hex[..digest_hex.len().min(2)];
        self.blobs_dir().join(DIGEST_ALGO).join(prefix).join(digest_hex)
    }

    pub fn ref_dir(&self, id: &ModelIdentifier) -> PathBuf {
        self.refs_dir()
            .join(id.transport.token())
            .join(id.organization_dir())
            .join(&id.name)
    }

    pub fn ref_path(&self, id: &ModelIdentifier) -> PathBuf {
        self.ref_dir(id)
            .join(format!("{}.json", id.reference.as_filename()))
    }

    pub fn snapshot_dir(&self, id: &ModelIdentifier) -> PathBuf {
        self.snapshots_dir()
            .join(id.transport.token())
            .join(id.organization_dir())
            .join(&id.name)
            .join(id.reference.as_filename())
    }

    /// Create all namespace directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.blobs_dir().join(DIGEST_ALGO),
            self.refs_dir(),
            self.snapshots_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io_with_path(e, dir.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{parse, TransportKind};

    #[test]
    fn test_blob_path_sharding() {
        let layout = StoreLayout::new("/store");
        let path = layout.blob_path("abcdef0123");
        assert_eq!(
            path,
            PathBuf::from("/store/blobs/sha256/ab/abcdef0123")
        );
    }

    #[test]
    fn test_ref_path_for_ollama() {
        let layout = StoreLayout::new("/store");
        let id = parse("ollama://tinyllama", TransportKind::Ollama).unwrap();
        assert_eq!(
            layout.ref_path(&id),
            PathBuf::from("/store/refs/hub/library/tinyllama/latest.json")
        );
    }

    #[test]
    fn test_snapshot_dir_sanitizes_digest_refs() {
        let layout = StoreLayout::new("/store");
        let id = parse("oci://quay.io/acme/granite@sha256:beef", TransportKind::Ollama).unwrap();
        let dir = layout.snapshot_dir(&id);
        assert!(dir.ends_with("oci/acme/granite/sha256-beef"));
    }

    #[test]
    fn test_ensure_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();
        assert!(layout.blobs_dir().join("sha256").is_dir());
        assert!(layout.refs_dir().is_dir());
        assert!(layout.snapshots_dir().is_dir());
        assert!(layout.tmp_dir().is_dir());
    }
}
