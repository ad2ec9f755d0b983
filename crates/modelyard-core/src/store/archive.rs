//! Store export and import as gzip-compressed tarballs.
//!
//! Export serializes all three namespaces. Import unpacks into a staging
//! directory and re-hashes every blob against its digest path, checking
//! every ref for completeness *before* anything reaches the store: a
//! corrupt tarball must not populate it. Snapshots are rebuilt from the
//! imported refs rather than trusted from the archive.

use crate::digest;
use crate::error::{Result, StoreError};
use crate::store::blob::BlobStore;
use crate::store::refs::{RefFile, RefStore};
use crate::store::snapshot::SnapshotStore;
use crate::store::StoreLayout;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub refs_imported: usize,
    pub blobs_imported: usize,
    /// Blobs already present before the import (dedup hits).
    pub blobs_deduplicated: usize,
}

/// Serialize the whole store into a `.tar.gz` at `output`.
pub fn export(layout: &StoreLayout, output: &Path) -> Result<()> {
    let file =
        std::fs::File::create(output).map_err(|e| StoreError::io_with_path(e, output.to_path_buf()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    // Snapshot symlinks are archived as symlinks, never followed.
    builder.follow_symlinks(false);

    for (name, dir) in [
        ("blobs", layout.blobs_dir()),
        ("refs", layout.refs_dir()),
        ("snapshots", layout.snapshots_dir()),
    ] {
        if dir.is_dir() {
            builder
                .append_dir_all(name, &dir)
                .map_err(|e| StoreError::io_with_path(e, dir.clone()))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| StoreError::io_with_path(e, output.to_path_buf()))?;
    encoder
        .finish()
        .map_err(|e| StoreError::io_with_path(e, output.to_path_buf()))?;

    info!("Exported store to {}", output.display());
    Ok(())
}

/// Extract `input` into the store, re-validating every blob digest first.
pub fn import(
    layout: &StoreLayout,
    blobs: &BlobStore,
    refs: &RefStore,
    snapshots: &SnapshotStore,
    input: &Path,
) -> Result<ImportReport> {
    layout.ensure_dirs()?;

    // Stage inside the store's tmp namespace so the final blob moves are
    // same-filesystem renames.
    let staging = tempfile::tempdir_in(layout.tmp_dir())
        .map_err(|e| StoreError::io_with_path(e, layout.tmp_dir()))?;

    let file =
        std::fs::File::open(input).map_err(|e| StoreError::io_with_path(e, input.to_path_buf()))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(staging.path())
        .map_err(|e| StoreError::ImportRejected(format!("failed to unpack archive: {e}")))?;

    // Phase 1: validate everything while nothing has touched the store.
    let staged_blobs = collect_staged_blobs(staging.path())?;
    for (digest_hex, path) in &staged_blobs {
        let actual = digest::hash_file(path)?;
        if &actual != digest_hex {
            return Err(StoreError::ImportRejected(format!(
                "blob {digest_hex} hashes to {actual}; archive is corrupt"
            )));
        }
    }

    let staged_refs = collect_staged_refs(staging.path())?;
    for ref_file in &staged_refs {
        for blob in &ref_file.blobs {
            if blob.source_path.is_some() {
                continue;
            }
            let digest_hex = blob.digest_hex();
            if !staged_blobs.iter().any(|(d, _)| d == digest_hex) && !blobs.has(digest_hex) {
                return Err(StoreError::ImportRejected(format!(
                    "ref {} references missing blob {digest_hex}",
                    ref_file.identifier
                )));
            }
        }
    }

    // Phase 2: admit content.
    let mut report = ImportReport::default();
    for (digest_hex, path) in &staged_blobs {
        if blobs.has(digest_hex) {
            report.blobs_deduplicated += 1;
            continue;
        }
        blobs.commit_partial(path, Some(digest_hex))?;
        report.blobs_imported += 1;
    }
    for ref_file in &staged_refs {
        refs.write(ref_file)?;
        snapshots.build(ref_file, blobs)?;
        report.refs_imported += 1;
    }

    info!(
        "Imported {} ref(s), {} blob(s) ({} deduplicated) from {}",
        report.refs_imported,
        report.blobs_imported,
        report.blobs_deduplicated,
        input.display()
    );
    Ok(report)
}

fn collect_staged_blobs(staging: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let blobs_dir = staging.join("blobs").join("sha256");
    let mut staged = Vec::new();
    if !blobs_dir.is_dir() {
        return Ok(staged);
    }
    for entry in walkdir::WalkDir::new(&blobs_dir).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| StoreError::Io {
            message: e.to_string(),
            path: Some(blobs_dir.clone()),
            source: None,
        })?;
        if entry.file_type().is_file() {
            staged.push((
                entry.file_name().to_string_lossy().into_owned(),
                entry.path().to_path_buf(),
            ));
        }
    }
    debug!("Archive stages {} blob(s)", staged.len());
    Ok(staged)
}

fn collect_staged_refs(staging: &Path) -> Result<Vec<RefFile>> {
    let refs_dir = staging.join("refs");
    let mut staged = Vec::new();
    if !refs_dir.is_dir() {
        return Ok(staged);
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
        let content = std::fs::read_to_string(entry.path())
            .map_err(|e| StoreError::io_with_path(e, entry.path().to_path_buf()))?;
        let ref_file: RefFile = serde_json::from_str(&content).map_err(|e| {
            StoreError::ImportRejected(format!(
                "malformed ref {}: {e}",
                entry.path().display()
            ))
        })?;
        staged.push(ref_file);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{parse, TransportKind};
    use crate::store::refs::{BlobRole, RefBlob};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        layout: StoreLayout,
        blobs: BlobStore,
        refs: RefStore,
        snapshots: SnapshotStore,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path().join("store"));
        layout.ensure_dirs().unwrap();
        Fixture {
            blobs: BlobStore::new(layout.clone()),
            refs: RefStore::new(layout.clone()),
            snapshots: SnapshotStore::new(layout.clone()),
            layout,
            _tmp: tmp,
        }
    }

    fn populate(f: &Fixture, model: &str, content: &[u8]) -> RefFile {
        let blob = f.blobs.put_bytes(content).unwrap();
        let id = parse(model, TransportKind::Ollama).unwrap();
        let ref_file = RefFile::new(
            id,
            vec![RefBlob::new(
                &blob.digest,
                blob.size,
                BlobRole::File,
                "model.file",
            )],
            true,
        );
        f.refs.write(&ref_file).unwrap();
        f.snapshots.build(&ref_file, &f.blobs).unwrap();
        ref_file
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = fixture();
        populate(&source, "ollama://alpha", b"alpha weights");
        populate(&source, "ollama://beta", b"beta weights");

        let archive_path = source._tmp.path().join("store.tar.gz");
        export(&source.layout, &archive_path).unwrap();

        let dest = fixture();
        let report = import(
            &dest.layout,
            &dest.blobs,
            &dest.refs,
            &dest.snapshots,
            &archive_path,
        )
        .unwrap();

        assert_eq!(report.refs_imported, 2);
        assert_eq!(report.blobs_imported, 2);

        // Identical ref set and blob digests.
        let mut src_names: Vec<String> = source
            .refs
            .list()
            .unwrap()
            .iter()
            .map(|r| r.identifier.to_string())
            .collect();
        let mut dst_names: Vec<String> = dest
            .refs
            .list()
            .unwrap()
            .iter()
            .map(|r| r.identifier.to_string())
            .collect();
        src_names.sort();
        dst_names.sort();
        assert_eq!(src_names, dst_names);

        let mut src_digests = source.blobs.list_digests().unwrap();
        let mut dst_digests = dest.blobs.list_digests().unwrap();
        src_digests.sort();
        dst_digests.sort();
        assert_eq!(src_digests, dst_digests);

        // Snapshots were rebuilt and resolve.
        for ref_file in dest.refs.list().unwrap() {
            assert!(dest.snapshots.verify(&ref_file).unwrap());
        }
    }

    #[test]
    fn test_corrupt_blob_rejected_without_side_effects() {
        let source = fixture();
        let ref_file = populate(&source, "ollama://tainted", b"original");

        // Corrupt the stored blob, then export.
        let blob_path = source.blobs.path(ref_file.blobs[0].digest_hex());
        std::fs::write(&blob_path, b"tampered!").unwrap();
        let archive_path = source._tmp.path().join("bad.tar.gz");
        export(&source.layout, &archive_path).unwrap();

        let dest = fixture();
        let err = import(
            &dest.layout,
            &dest.blobs,
            &dest.refs,
            &dest.snapshots,
            &archive_path,
        )
        .unwrap_err();

        assert!(matches!(err, StoreError::ImportRejected(_)));
        assert!(dest.blobs.list_digests().unwrap().is_empty());
        assert!(dest.refs.list().unwrap().is_empty());
    }

    #[test]
    fn test_ref_with_missing_blob_rejected() {
        let source = fixture();
        let ref_file = populate(&source, "ollama://hollow", b"content");

        // Drop the blob so the archived ref dangles.
        source
            .blobs
            .remove_unchecked(ref_file.blobs[0].digest_hex())
            .unwrap();
        let archive_path = source._tmp.path().join("dangling.tar.gz");
        export(&source.layout, &archive_path).unwrap();

        let dest = fixture();
        let err = import(
            &dest.layout,
            &dest.blobs,
            &dest.refs,
            &dest.snapshots,
            &archive_path,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ImportRejected(_)));
    }

    #[test]
    fn test_import_into_populated_store_deduplicates() {
        let source = fixture();
        populate(&source, "ollama://shared", b"common bytes");
        let archive_path = source._tmp.path().join("dup.tar.gz");
        export(&source.layout, &archive_path).unwrap();

        let dest = fixture();
        populate(&dest, "ollama://shared", b"common bytes");

        let report = import(
            &dest.layout,
            &dest.blobs,
            &dest.refs,
            &dest.snapshots,
            &archive_path,
        )
        .unwrap();

        assert_eq!(report.blobs_imported, 0);
        assert_eq!(report.blobs_deduplicated, 1);
        assert_eq!(dest.blobs.list_digests().unwrap().len(), 1);
    }
}
