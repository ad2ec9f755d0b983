//! Registry transports.
//!
//! One capability interface ([`Transport`]: `pull`, `push`, `exists`,
//! `list_entry`), one implementation per registry kind, selected by the
//! parsed scheme. All transports share the same pull shape: resolve -> fetch
//! manifest -> download missing blobs -> write ref -> build snapshot. The
//! ref is written only after every blob is present and verified, so a
//! partial pull leaves no ref behind.

pub mod http_artifact;
pub mod hub;
pub mod huggingface;
pub mod modelscope;
pub mod oci;
pub mod ollama;
pub mod resolver;
pub mod url;

use crate::config::{AuthConfig, StoreConfig};
use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::network::{HttpClient, RetryConfig};
use crate::store::blob::BlobStore;
use crate::store::refs::{BlobRole, RefBlob, RefFile, RefStore};
use crate::store::snapshot::SnapshotStore;
use crate::store::StoreLayout;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Logical name given to the primary model blob in hub snapshots.
pub const ENTRY_FILE_NAME: &str = "model.file";
/// Logical name of the extracted chat template snapshot entry.
pub const CHAT_TEMPLATE_NAME: &str = "chat_template";

/// Everything a transport needs to do its work.
pub struct TransportContext {
    pub layout: StoreLayout,
    pub blobs: BlobStore,
    pub refs: RefStore,
    pub snapshots: SnapshotStore,
    pub client: HttpClient,
    pub retry: RetryConfig,
    pub auth: AuthConfig,
}

impl TransportContext {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let layout = StoreLayout::new(&config.root);
        layout.ensure_dirs()?;
        Ok(Self {
            blobs: BlobStore::new(layout.clone()),
            refs: RefStore::new(layout.clone()),
            snapshots: SnapshotStore::new(layout.clone()),
            layout,
            client: HttpClient::new()?,
            retry: config.retry.clone(),
            auth: config.auth.clone(),
        })
    }
}

/// The capability interface every registry kind implements.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Fetch the model into the store, returning its ref.
    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile>;

    /// Upload a locally stored model to `target`.
    async fn push(&self, _source: &RefFile, _target: &ModelIdentifier) -> Result<()> {
        Err(StoreError::Config {
            message: format!("push is not supported by the {} transport", self.kind()),
        })
    }

    /// Whether the model is fully present in the local store.
    async fn exists(&self, id: &ModelIdentifier) -> Result<bool>;

    /// Host path of the model's entry file, for the caller to mount.
    async fn list_entry(&self, id: &ModelIdentifier) -> Result<PathBuf>;
}

/// Hook for converting safetensors sources to GGUF ahead of an OCI push.
/// The conversion tooling itself belongs to the container-assembly
/// collaborator; the store only invokes it.
#[async_trait]
pub trait ModelConverter: Send + Sync {
    /// Convert `source` into a GGUF file under `work_dir`; returns the
    /// produced path.
    async fn convert(&self, source: &std::path::Path, work_dir: &std::path::Path)
        -> Result<PathBuf>;
}

/// Return the existing ref if every blob it names is locally present (and,
/// for reference blobs, the source is unchanged).
pub(crate) fn cached_complete(ctx: &TransportContext, id: &ModelIdentifier) -> Option<RefFile> {
    let ref_file = ctx.refs.read(id).ok()?;
    for blob in &ref_file.blobs {
        match &blob.source_path {
            Some(source) => {
                let mtime = source_mtime_unix(source)?;
                if Some(mtime) != blob.source_mtime_unix {
                    debug!("Source {} changed since ingest", source.display());
                    return None;
                }
            }
            None => {
                if !ctx.blobs.has(blob.digest_hex()) {
                    return None;
                }
            }
        }
    }
    Some(ref_file)
}

/// Shared tail of every pull: validate model files, extract the embedded
/// chat template, write the ref atomically, materialize the snapshot. A
/// re-pull replaces (never merges) the previous ref; blobs only the old ref
/// held are collected right away.
pub(crate) async fn commit_pull(
    ctx: &TransportContext,
    id: &ModelIdentifier,
    mut blobs: Vec<RefBlob>,
    verified: bool,
) -> Result<RefFile> {
    validate_model_files(ctx, &blobs)?;
    extract_chat_template(ctx, &mut blobs);

    let previous = ctx.refs.read(id).ok();

    let ref_file = RefFile::new(id.clone(), blobs, verified);
    ctx.refs.write(&ref_file)?;
    if previous.is_some() {
        // Stale entries from the replaced ref must not linger in the view.
        ctx.snapshots.remove(id)?;
    }
    ctx.snapshots.build(&ref_file, &ctx.blobs)?;

    if let Some(previous) = previous {
        let stale: Vec<RefBlob> = previous
            .blobs
            .into_iter()
            .filter(|b| !ref_file.references_digest(b.digest_hex()))
            .collect();
        if !stale.is_empty() {
            crate::store::gc::collect_blobs(&ctx.blobs, &ctx.refs, &stale)?;
        }
    }

    Ok(ref_file)
}

/// Reject pulled GGUF files with malformed headers or a byte order the host
/// cannot load. Runs before the ref is written, so a failure leaves no ref.
fn validate_model_files(ctx: &TransportContext, blobs: &[RefBlob]) -> Result<()> {
    use modelyard_inspect::{gguf, ByteOrder};

    for blob in blobs.iter().filter(|b| b.is_model_file()) {
        let path = match &blob.source_path {
            Some(source) => source.clone(),
            None => ctx.blobs.path(blob.digest_hex()),
        };
        if !gguf::is_gguf(&path) {
            continue;
        }

        gguf::parse_file(&path)?;

        let model_order = gguf::byte_order(&path)?;
        let host_order = ByteOrder::host();
        if model_order != host_order {
            return Err(StoreError::EndianMismatch {
                host: host_order.to_string(),
                model: model_order.to_string(),
            });
        }
    }
    Ok(())
}

/// Materialize the chat template embedded in the first GGUF model file as a
/// derived snapshot entry, when the pull didn't already provide one.
fn extract_chat_template(ctx: &TransportContext, blobs: &mut Vec<RefBlob>) {
    use modelyard_inspect::gguf;

    if blobs.iter().any(|b| b.logical_path == CHAT_TEMPLATE_NAME) {
        return;
    }
    let Some(model) = blobs.iter().find(|b| b.is_model_file()) else {
        return;
    };
    let path = match &model.source_path {
        Some(source) => source.clone(),
        None => ctx.blobs.path(model.digest_hex()),
    };
    if !gguf::is_gguf(&path) {
        return;
    }

    let template = match gguf::parse_file(&path) {
        Ok(header) => header.chat_template().map(str::to_string),
        Err(e) => {
            warn!("Skipping chat template extraction: {e}");
            None
        }
    };
    let Some(template) = template else { return };

    match ctx.blobs.put_bytes(template.as_bytes()) {
        Ok(blob) => {
            debug!("Extracted embedded chat template ({} bytes)", blob.size);
            blobs.push(RefBlob::new(
                &blob.digest,
                blob.size,
                BlobRole::File,
                CHAT_TEMPLATE_NAME,
            ));
        }
        Err(e) => warn!("Failed to store extracted chat template: {e}"),
    }
}

/// Select the entry file the runtime should load.
///
/// GGUF wins; for split models the part-1 file is the entry. A pure
/// safetensors model has no single entry file, so the snapshot directory is
/// returned instead.
pub(crate) fn entry_path(ctx: &TransportContext, ref_file: &RefFile) -> Result<PathBuf> {
    let gguf_files: Vec<&RefBlob> = ref_file
        .model_files()
        .filter(|b| b.logical_path.ends_with(".gguf") || b.logical_path == ENTRY_FILE_NAME)
        .collect();

    if !gguf_files.is_empty() {
        let entry = if gguf_files.len() > 1 {
            gguf_files
                .iter()
                .find(|b| is_split_name(&b.logical_path) && is_first_split_part(&b.logical_path))
                .copied()
                .unwrap_or(gguf_files[0])
        } else {
            gguf_files[0]
        };
        return Ok(match &entry.source_path {
            Some(source) => source.clone(),
            None => ctx.blobs.path(entry.digest_hex()),
        });
    }

    if ref_file
        .model_files()
        .any(|b| b.logical_path.ends_with(".safetensors"))
    {
        return Ok(ctx.snapshots.dir(&ref_file.identifier));
    }

    // Single-blob URL/file models carry arbitrary extensions; any file-role
    // blob can serve as the entry.
    ref_file
        .model_files()
        .next()
        .or_else(|| ref_file.blobs.iter().find(|b| b.role == BlobRole::File))
        .map(|b| match &b.source_path {
            Some(source) => source.clone(),
            None => ctx.blobs.path(b.digest_hex()),
        })
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "{} has no model file entry",
                ref_file.identifier
            ))
        })
}

/// `model-00001-of-00005.gguf` style split-file naming.
pub(crate) fn is_split_name(name: &str) -> bool {
    split_regex().is_match(name)
}

pub(crate) fn is_first_split_part(name: &str) -> bool {
    name.contains("-00001-of-")
}

fn split_regex() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"-\d{5}-of-\d{5}\.gguf$").expect("static regex"))
}

pub(crate) fn source_mtime_unix(path: &std::path::Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs() as i64)
}
