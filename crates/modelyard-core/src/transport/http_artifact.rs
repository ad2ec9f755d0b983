//! HTTP artifact fallback.
//!
//! Used when the strategy chain finds neither artifact nor image mounts
//! viable: registry content is fetched over the same wire protocol as the
//! OCI transport but recorded under its own transport namespace, and the
//! resulting blob paths are plain files the caller can bind-mount.

use crate::error::Result;
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::store::refs::RefFile;
use crate::transport::oci::OciTransport;
use crate::transport::{Transport, TransportContext};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct HttpArtifactTransport {
    inner: OciTransport,
}

impl HttpArtifactTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            inner: OciTransport::new(ctx).with_kind(TransportKind::HttpArtifact),
        }
    }
}

#[async_trait]
impl Transport for HttpArtifactTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpArtifact
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        self.inner.pull(id).await
    }

    async fn push(&self, source: &RefFile, target: &ModelIdentifier) -> Result<()> {
        self.inner.push(source, target).await
    }

    async fn exists(&self, id: &ModelIdentifier) -> Result<bool> {
        self.inner.exists(id).await
    }

    async fn list_entry(&self, id: &ModelIdentifier) -> Result<PathBuf> {
        self.inner.list_entry(id).await
    }
}
