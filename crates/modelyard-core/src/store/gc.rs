//! Garbage collection.
//!
//! Liveness condition: a blob is live if any ref file references it OR it is
//! part of an in-flight write. In-flight state is either a file under `tmp/`
//! (invisible to `blobs/` by construction) or a very recently renamed blob
//! whose ref has not landed yet; both are covered by an age gate.
//!
//! A scoped pass runs on every `remove`, covering just the removed ref's
//! blobs; `sweep` does the full store: orphan blobs, snapshots without a
//! ref, broken snapshot links, stale `tmp/` files, empty directories.

use crate::config::StoreTuning;
use crate::error::{Result, StoreError};
use crate::store::blob::BlobStore;
use crate::store::refs::{RefFile, RefStore};
use crate::store::StoreLayout;
use std::time::SystemTime;
use tracing::{debug, info};

/// What a GC pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub blobs_removed: usize,
    pub bytes_freed: u64,
    pub snapshots_removed: usize,
    pub broken_links_removed: usize,
    pub tmp_files_removed: usize,
}

/// Free the blobs a just-removed ref held, where no surviving ref still
/// references them.
pub fn collect_scoped(blobs: &BlobStore, refs: &RefStore, removed: &RefFile) -> Result<GcReport> {
    collect_blobs(blobs, refs, &removed.blobs)
}

/// Free the given blobs where no ref references them. Used after `remove`
/// and after a re-pull replaces a ref with a different blob set.
pub fn collect_blobs(
    blobs: &BlobStore,
    refs: &RefStore,
    candidates: &[crate::store::refs::RefBlob],
) -> Result<GcReport> {
    let mut report = GcReport::default();

    for blob in candidates {
        let digest = blob.digest_hex();
        if refs.count_references(digest)? > 0 {
            debug!("Keeping blob {digest}: still referenced");
            continue;
        }
        if let Ok(size) = blobs.size(digest) {
            report.bytes_freed += size;
        }
        blobs.remove_unchecked(digest)?;
        report.blobs_removed += 1;
    }

    if report.blobs_removed > 0 {
        info!(
            "Freed {} blob(s), {} bytes",
            report.blobs_removed, report.bytes_freed
        );
    }
    Ok(report)
}

/// Full-store pass.
pub fn sweep(layout: &StoreLayout, blobs: &BlobStore, refs: &RefStore) -> Result<GcReport> {
    let mut report = GcReport::default();
    let live = refs.referenced_digests()?;
    let cutoff = SystemTime::now()
        .checked_sub(StoreTuning::TMP_REAP_AGE)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    // Orphan blobs. Recently written blobs count as in-flight: their ref may
    // still be on the way.
    for digest in blobs.list_digests()? {
        if live.contains(&digest) {
            continue;
        }
        let path = blobs.path(&digest);
        if modified_after(&path, cutoff) {
            debug!("Keeping young orphan blob {digest} (possible in-flight pull)");
            continue;
        }
        if let Ok(meta) = std::fs::metadata(&path) {
            report.bytes_freed += meta.len();
        }
        blobs.remove_unchecked(&digest)?;
        report.blobs_removed += 1;
    }

    sweep_snapshots(layout, &mut report)?;
    sweep_tmp(layout, cutoff, &mut report)?;
    remove_empty_dirs(layout, &mut report)?;

    info!(
        "Sweep complete: {} blob(s), {} snapshot dir(s), {} broken link(s), {} tmp file(s)",
        report.blobs_removed,
        report.snapshots_removed,
        report.broken_links_removed,
        report.tmp_files_removed
    );
    Ok(report)
}

/// Snapshot dirs with no ref file are leftovers; within live snapshots,
/// links that no longer resolve are dropped (the next build re-creates
/// them).
fn sweep_snapshots(layout: &StoreLayout, report: &mut GcReport) -> Result<()> {
    let snapshots_dir = layout.snapshots_dir();
    if !snapshots_dir.is_dir() {
        return Ok(());
    }

    // snapshots/<transport>/<org...>/<name>/<reference> mirrors
    // refs/<transport>/<org...>/<name>/<reference>.json. A directory is a
    // reference dir exactly when its mirror is NOT a directory but its
    // parent's mirror IS (organizations may span several levels).
    let refs_dir = layout.refs_dir();
    let mut walker = walkdir::WalkDir::new(&snapshots_dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| StoreError::Io {
            message: e.to_string(),
            path: Some(snapshots_dir.clone()),
            source: None,
        })?;
        let path = entry.path();

        if entry.file_type().is_dir() {
            let relative = path.strip_prefix(&snapshots_dir).expect("under snapshots");
            if refs_dir.join(relative).is_dir() {
                // Intermediate level (transport/org/name); keep descending.
                continue;
            }
            let parent_is_mirrored = relative
                .parent()
                .map(|p| refs_dir.join(p).is_dir())
                .unwrap_or(false);
            if !parent_is_mirrored {
                // Content nested inside a snapshot; nothing to check below.
                walker.skip_current_dir();
                continue;
            }

            // Append rather than set_extension: a tag like "v1.2" must map
            // to "v1.2.json", not "v1.json".
            let ref_name = format!(
                "{}.json",
                relative
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            let ref_path = refs_dir
                .join(relative.parent().unwrap_or_else(|| std::path::Path::new("")))
                .join(ref_name);
            if !ref_path.is_file() {
                debug!("Removing snapshot without ref: {}", path.display());
                std::fs::remove_dir_all(path)
                    .map_err(|e| StoreError::io_with_path(e, path.to_path_buf()))?;
                report.snapshots_removed += 1;
            }
            // Either removed or a live snapshot; broken links inside live
            // snapshots are handled by the file branch on deeper entries,
            // so only skip descent after a removal.
            if !path.exists() {
                walker.skip_current_dir();
            }
            continue;
        }

        if path.symlink_metadata().is_ok() && std::fs::metadata(path).is_err() {
            debug!("Removing broken snapshot link: {}", path.display());
            std::fs::remove_file(path)
                .map_err(|e| StoreError::io_with_path(e, path.to_path_buf()))?;
            report.broken_links_removed += 1;
        }
    }
    Ok(())
}

fn sweep_tmp(layout: &StoreLayout, cutoff: SystemTime, report: &mut GcReport) -> Result<()> {
    let tmp_dir = layout.tmp_dir();
    if !tmp_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&tmp_dir).map_err(|e| StoreError::io_with_path(e, &tmp_dir))? {
        let entry = entry.map_err(|e| StoreError::io_with_path(e, &tmp_dir))?;
        let path = entry.path();
        if path.is_file() && !modified_after(&path, cutoff) {
            debug!("Reaping stale tmp file {}", path.display());
            std::fs::remove_file(&path).map_err(|e| StoreError::io_with_path(e, path.clone()))?;
            report.tmp_files_removed += 1;
        }
    }
    Ok(())
}

fn remove_empty_dirs(layout: &StoreLayout, _report: &mut GcReport) -> Result<()> {
    for namespace in [layout.blobs_dir(), layout.refs_dir(), layout.snapshots_dir()] {
        if !namespace.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&namespace)
            .min_depth(1)
            .contents_first(true)
        {
            let entry = entry.map_err(|e| StoreError::Io {
                message: e.to_string(),
                path: Some(namespace.clone()),
                source: None,
            })?;
            if entry.file_type().is_dir() {
                // remove_dir fails on non-empty dirs, which is exactly what
                // we want here.
                let _ = std::fs::remove_dir(entry.path());
            }
        }
    }
    Ok(())
}

fn modified_after(path: &std::path::Path, cutoff: SystemTime) -> bool {
    std::fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| mtime > cutoff)
        .unwrap_or(true)
}
