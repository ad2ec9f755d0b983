//! Shared core for HuggingFace-style hub APIs.
//!
//! Both hub ecosystems follow the same shape: a metadata API that yields a
//! server-side sha256 for a file, a `resolve/<revision>` endpoint that
//! serves the bytes, and a handful of ancillary config files worth pulling
//! alongside the weights but never worth failing a pull over.

use crate::error::{Result, StoreError};
use crate::network::download::{fetch_resumable, fetch_to_blob};
use crate::network::with_retry;
use crate::store::refs::{BlobRole, RefBlob};
use crate::transport::TransportContext;
use reqwest::header::HeaderMap;
use std::path::Path;
use tracing::{debug, warn};

/// Config files pulled non-fatally alongside the weights.
pub const ANCILLARY_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer_config.json",
];

/// One planned download from a hub repository.
#[derive(Debug, Clone)]
pub struct HubFile {
    /// Path of the file within the repository.
    pub remote_name: String,
    /// Name the file takes in the snapshot.
    pub logical_path: String,
    /// Server-declared `sha256:` digest, when the API offers one.
    pub expected_digest: Option<String>,
    pub role: BlobRole,
    /// Required files fail the pull on 404; optional ones are dropped.
    pub required: bool,
    /// Large weights resume via HTTP Range; small configs restart.
    pub resumable: bool,
}

impl HubFile {
    pub fn weight(remote_name: &str, digest: &str) -> Self {
        Self {
            remote_name: remote_name.to_string(),
            logical_path: remote_name.to_string(),
            expected_digest: Some(digest.to_string()),
            role: BlobRole::File,
            required: true,
            resumable: true,
        }
    }

    pub fn optional_weight(remote_name: &str, digest: &str) -> Self {
        Self {
            required: false,
            ..Self::weight(remote_name, digest)
        }
    }

    pub fn ancillary(remote_name: &str) -> Self {
        Self {
            remote_name: remote_name.to_string(),
            logical_path: remote_name.to_string(),
            expected_digest: None,
            role: BlobRole::Config,
            required: false,
            resumable: false,
        }
    }
}

/// Read a bearer token from a conventional token file.
pub fn read_token_file(path: &Path) -> Option<String> {
    let token = std::fs::read_to_string(path).ok()?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract the sha256 from a git-LFS pointer (`oid sha256:<hex>` line).
pub fn parse_lfs_pointer(data: &str) -> Option<String> {
    data.lines()
        .find_map(|line| line.strip_prefix("oid sha256:"))
        .map(|hex| hex.trim().to_string())
}

/// Execute a download plan against `resolve_base` (the `…/resolve/<rev>`
/// prefix), returning the blob entries for the ref file.
pub(crate) async fn pull_files(
    ctx: &TransportContext,
    resolve_base: &str,
    token: Option<&str>,
    files: Vec<HubFile>,
) -> Result<Vec<RefBlob>> {
    let mut blobs = Vec::new();

    for file in files {
        let url = format!("{resolve_base}/{}", file.remote_name);

        if let Some(expected) = &file.expected_digest {
            if ctx.blobs.has(expected) {
                debug!("{} already cached", file.remote_name);
                let size = ctx.blobs.size(expected)?;
                blobs.push(RefBlob::new(
                    crate::digest::strip_prefix(expected),
                    size,
                    file.role,
                    file.logical_path,
                ));
                continue;
            }
        }

        let downloaded = if file.resumable {
            let resume_key = file
                .expected_digest
                .clone()
                .unwrap_or_else(|| crate::digest::hash_bytes(url.as_bytes()));
            with_retry(&ctx.retry, "hub download", || {
                fetch_resumable(
                    &ctx.client,
                    &ctx.blobs,
                    &url,
                    HeaderMap::new(),
                    token,
                    &resume_key,
                    file.expected_digest.as_deref(),
                    None,
                )
            })
            .await
        } else {
            with_retry(&ctx.retry, "hub download", || {
                fetch_to_blob(
                    &ctx.client,
                    &ctx.blobs,
                    &url,
                    None,
                    token,
                    file.expected_digest.as_deref(),
                    None,
                )
            })
            .await
        };

        match downloaded {
            Ok(blob) => {
                blobs.push(RefBlob::new(
                    &blob.digest,
                    blob.size,
                    file.role,
                    file.logical_path,
                ));
            }
            Err(StoreError::NotFound(_)) if !file.required => {
                warn!("Optional file {} not present upstream, skipping", file.remote_name);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(blobs)
}
