//! Transport for the ollama model hub.
//!
//! The hub serves Docker-style v2 manifests from `registry.ollama.ai`;
//! layers carry `application/vnd.ollama.image.*` media types that map onto
//! blob roles. The weights layer becomes the snapshot's `model.file` entry.

use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::network::download::fetch_to_blob;
use crate::network::with_retry;
use crate::store::refs::{BlobRole, RefBlob, RefFile};
use crate::transport::{
    cached_complete, commit_pull, entry_path, Transport, TransportContext, CHAT_TEMPLATE_NAME,
    ENTRY_FILE_NAME,
};
use crate::transport::oci::{Descriptor, Manifest};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const REGISTRY_BASE: &str = "https://registry.ollama.ai";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

const MEDIA_TYPE_MODEL: &str = "application/vnd.ollama.image.model";
const MEDIA_TYPE_TEMPLATE: &str = "application/vnd.ollama.image.template";

/// Map an ollama layer to a role and snapshot name.
///
/// Unrecognized layer kinds (license, params, system prompt) keep the tail
/// of their media type as the file name.
fn classify_layer(layer: &Descriptor) -> (BlobRole, String) {
    match layer.media_type.as_str() {
        MEDIA_TYPE_MODEL => (BlobRole::File, ENTRY_FILE_NAME.to_string()),
        MEDIA_TYPE_TEMPLATE => (BlobRole::File, CHAT_TEMPLATE_NAME.to_string()),
        other => {
            let name = other.rsplit('.').next().unwrap_or("layer").to_string();
            (BlobRole::Layer, name)
        }
    }
}

pub struct OllamaTransport {
    ctx: Arc<TransportContext>,
}

impl OllamaTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn registry_path(id: &ModelIdentifier) -> String {
        format!("{}/{}", id.organization_dir(), id.name)
    }

    fn manifest_url(id: &ModelIdentifier) -> String {
        format!(
            "{REGISTRY_BASE}/v2/{}/manifests/{}",
            Self::registry_path(id),
            id.reference
        )
    }

    fn blob_url(id: &ModelIdentifier, digest: &str) -> String {
        format!(
            "{REGISTRY_BASE}/v2/{}/blobs/{digest}",
            Self::registry_path(id)
        )
    }

    async fn fetch_manifest(&self, id: &ModelIdentifier) -> Result<(Manifest, Vec<u8>)> {
        let url = Self::manifest_url(id);
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(MANIFEST_MEDIA_TYPE));

        let response = self.ctx.client.get(&url, Some(headers), None).await;
        let response = match response {
            Err(StoreError::NotFound(_)) => {
                return Err(StoreError::NotFound(format!(
                    "manifest for {id} was not found in the ollama registry"
                )))
            }
            other => other?,
        };

        let raw = response.bytes().await.map_err(StoreError::from)?.to_vec();
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::UnsupportedMediaType(format!("unparsable manifest: {e}")))?;
        debug!("Fetched ollama manifest for {id}");
        Ok((manifest, raw))
    }
}

#[async_trait]
impl Transport for OllamaTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ollama
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        if let Some(cached) = cached_complete(&self.ctx, id) {
            info!("Using cached {id}");
            return Ok(cached);
        }

        let ctx = &self.ctx;
        let (manifest, raw) =
            with_retry(&ctx.retry, "manifest fetch", || self.fetch_manifest(id)).await?;

        let mut blobs = Vec::new();
        let manifest_blob = ctx.blobs.put_bytes(&raw)?;
        blobs.push(RefBlob::new(
            &manifest_blob.digest,
            manifest_blob.size,
            BlobRole::Manifest,
            "manifest.json",
        ));

        if let Some(config) = &manifest.config {
            if !ctx.blobs.has(&config.digest) {
                let config_url = Self::blob_url(id, &config.digest);
                with_retry(&ctx.retry, "config download", || {
                    fetch_to_blob(
                        &ctx.client,
                        &ctx.blobs,
                        &config_url,
                        None,
                        None,
                        Some(&config.digest),
                        None,
                    )
                })
                .await?;
            }
            blobs.push(RefBlob::new(
                crate::digest::strip_prefix(&config.digest),
                config.size,
                BlobRole::Config,
                "config.json",
            ));
        }

        for layer in &manifest.layers {
            let (role, logical_path) = classify_layer(layer);
            if ctx.blobs.has(&layer.digest) {
                debug!("Layer {} already cached", layer.digest);
            } else {
                let layer_url = Self::blob_url(id, &layer.digest);
                with_retry(&ctx.retry, "layer download", || {
                    fetch_to_blob(
                        &ctx.client,
                        &ctx.blobs,
                        &layer_url,
                        None,
                        None,
                        Some(&layer.digest),
                        None,
                    )
                })
                .await?;
            }
            blobs.push(RefBlob::new(
                crate::digest::strip_prefix(&layer.digest),
                layer.size,
                role,
                logical_path,
            ));
        }

        commit_pull(ctx, id, blobs, true).await
    }

    async fn exists(&self, id: &ModelIdentifier) -> Result<bool> {
        Ok(cached_complete(&self.ctx, id).is_some())
    }

    async fn list_entry(&self, id: &ModelIdentifier) -> Result<PathBuf> {
        let ref_file = self.ctx.refs.read(id)?;
        entry_path(&self.ctx, &ref_file)
    }
}
