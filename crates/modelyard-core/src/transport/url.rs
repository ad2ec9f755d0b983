//! URL and local-file ingestion.
//!
//! `http(s)://` model strings are single-blob models downloaded into the
//! store. `file://` strings are *references*: the blob entry points at the
//! local source and is validated by modification time rather than digest,
//! since the source stays mutable under the user's control.

use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::network::download::fetch_to_blob;
use crate::network::with_retry;
use crate::store::refs::{BlobRole, RefBlob, RefFile};
use crate::transport::{
    cached_complete, commit_pull, entry_path, source_mtime_unix, Transport, TransportContext,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct UrlTransport {
    ctx: Arc<TransportContext>,
    /// The original model string, kept for exact URL reconstruction (the
    /// parsed identifier cannot distinguish `http` from `https`).
    source: Option<String>,
}

impl UrlTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx, source: None }
    }

    pub fn with_source(mut self, model: &str) -> Self {
        self.source = Some(model.to_string());
        self
    }

    fn download_url(&self, id: &ModelIdentifier) -> String {
        if let Some(source) = &self.source {
            return source.clone();
        }
        let mut url = String::from("https://");
        if let Some(host) = &id.host {
            url.push_str(host);
        }
        if let Some(org) = &id.organization {
            url.push('/');
            url.push_str(org);
        }
        url.push('/');
        url.push_str(&id.name);
        url
    }

    /// Local path a `file://` identifier points at.
    fn source_file(id: &ModelIdentifier) -> PathBuf {
        let mut path = PathBuf::from("/");
        if let Some(org) = &id.organization {
            path.push(org);
        }
        path.push(&id.name);
        path
    }

    async fn pull_http(&self, id: &ModelIdentifier) -> Result<RefFile> {
        let ctx = &self.ctx;
        let url = self.download_url(id);
        let blob = with_retry(&ctx.retry, "url download", || {
            fetch_to_blob(&ctx.client, &ctx.blobs, &url, None, None, None, None)
        })
        .await?;

        let blobs = vec![RefBlob::new(
            &blob.digest,
            blob.size,
            BlobRole::File,
            id.name.clone(),
        )];
        // No upstream digest exists to verify against.
        commit_pull(ctx, id, blobs, false).await
    }

    async fn pull_file(&self, id: &ModelIdentifier) -> Result<RefFile> {
        let ctx = &self.ctx;
        let source = Self::source_file(id);
        if !source.is_file() {
            return Err(StoreError::NotFound(format!(
                "{} does not exist",
                source.display()
            )));
        }

        let digest = crate::digest::hash_file_async(&source).await?;
        let size = std::fs::metadata(&source)
            .map_err(|e| StoreError::io_with_path(e, source.clone()))?
            .len();

        let mut blob = RefBlob::new(&digest, size, BlobRole::File, id.name.clone());
        blob.source_path = Some(source.clone());
        blob.source_mtime_unix = source_mtime_unix(&source);

        info!("Referencing local model {}", source.display());
        commit_pull(ctx, id, vec![blob], false).await
    }
}

#[async_trait]
impl Transport for UrlTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Url
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        if let Some(cached) = cached_complete(&self.ctx, id) {
            info!("Using cached {id}");
            return Ok(cached);
        }

        match id.transport {
            TransportKind::File => self.pull_file(id).await,
            _ => self.pull_http(id).await,
        }
    }

    async fn exists(&self, id: &ModelIdentifier) -> Result<bool> {
        Ok(cached_complete(&self.ctx, id).is_some())
    }

    async fn list_entry(&self, id: &ModelIdentifier) -> Result<PathBuf> {
        let ref_file = self.ctx.refs.read(id)?;
        entry_path(&self.ctx, &ref_file)
    }
}
