//! The store facade.
//!
//! [`ModelStore`] is the single entry point external collaborators call:
//! pull, push, list, remove, inspect, export, import, plus existence checks
//! and the on-demand GC sweep. It owns the resolver and the shared
//! transport context; errors surface with a stable [`crate::ErrorKind`] for
//! exit-code mapping.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::identifier::{self, ModelIdentifier, TransportKind};
use crate::store::archive::{self, ImportReport};
use crate::store::gc::{self, GcReport};
use crate::store::refs::RefFile;
use crate::transport::oci::OciTransport;
use crate::transport::resolver::{Resolver, RuntimeProbe};
use crate::transport::{ModelConverter, Transport, TransportContext};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Inspection result for a stored model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "format")]
pub enum ModelInfo {
    #[serde(rename = "GGUF")]
    Gguf {
        path: PathBuf,
        version: u32,
        byte_order: modelyard_inspect::ByteOrder,
        architecture: Option<String>,
        model_name: Option<String>,
        tensor_count: u64,
        /// Full metadata map; populated only when requested.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "safetensors")]
    Safetensors {
        path: PathBuf,
        tensor_count: usize,
        dtypes: Vec<String>,
    },
    #[serde(rename = "raw")]
    Other { path: PathBuf, size: u64 },
}

/// The model store and transport subsystem, behind one handle.
pub struct ModelStore {
    config: StoreConfig,
    ctx: Arc<TransportContext>,
    resolver: Resolver,
    converter: Option<Arc<dyn ModelConverter>>,
}

impl ModelStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let ctx = Arc::new(TransportContext::new(&config)?);
        let resolver = Resolver::new(ctx.clone(), &config);
        Ok(Self {
            config,
            ctx,
            resolver,
            converter: None,
        })
    }

    /// Attach the runtime capability probe (the container-engine callback).
    pub fn with_probe(mut self, probe: Box<dyn RuntimeProbe>) -> Self {
        self.resolver = Resolver::new(self.ctx.clone(), &self.config).with_probe(probe);
        if let Some(converter) = &self.converter {
            self.resolver = self.resolver.with_converter(converter.clone());
        }
        self
    }

    /// Attach the safetensors-to-GGUF conversion hook used before OCI push.
    pub fn with_converter(mut self, converter: Arc<dyn ModelConverter>) -> Self {
        self.resolver = self.resolver.with_converter(converter.clone());
        self.converter = Some(converter);
        self
    }

    /// Resolve and pull a model, returning its ref.
    pub async fn pull(&self, model: &str) -> Result<RefFile> {
        let resolution = self.resolver.resolve(model)?;
        info!("Pulling {}", resolution.identifier);
        resolution.transport.pull(&resolution.identifier).await
    }

    /// Push a locally stored model to an OCI target, pulling the source
    /// first if it is not present yet.
    pub async fn push(&self, source_model: &str, target_model: &str) -> Result<()> {
        let source = self.resolver.resolve(source_model)?;
        let ref_file = match crate::transport::cached_complete(&self.ctx, &source.identifier) {
            Some(ref_file) => ref_file,
            None => source.transport.pull(&source.identifier).await?,
        };

        let target = identifier::parse(target_model, TransportKind::Oci)?;
        if target.transport != TransportKind::Oci {
            return Err(StoreError::Config {
                message: format!("push target must be an OCI reference, got '{target_model}'"),
            });
        }

        let mut transport = OciTransport::new(self.ctx.clone());
        if let Some(converter) = &self.converter {
            transport = transport.with_converter(converter.clone());
        }
        info!("Pushing {} to {target}", source.identifier);
        transport.push(&ref_file, &target).await
    }

    /// Whether the model is fully present locally.
    pub async fn exists(&self, model: &str) -> Result<bool> {
        let resolution = self.resolver.resolve(model)?;
        resolution.transport.exists(&resolution.identifier).await
    }

    /// All stored refs, most recently modified first.
    pub fn list(&self) -> Result<Vec<RefFile>> {
        self.ctx.refs.list()
    }

    /// Host path of the model's entry file, for mounting.
    pub async fn list_entry(&self, model: &str) -> Result<PathBuf> {
        let resolution = self.resolver.resolve(model)?;
        resolution.transport.list_entry(&resolution.identifier).await
    }

    /// Remove a model: ref first, then snapshot, then a scoped GC pass over
    /// the blobs the ref held.
    pub async fn remove(&self, model: &str) -> Result<GcReport> {
        let id = self.local_identifier(model)?;
        let removed = self.ctx.refs.remove(&id)?;
        self.ctx.snapshots.remove(&id)?;
        let report = gc::collect_scoped(&self.ctx.blobs, &self.ctx.refs, &removed)?;
        info!("Removed {id}");
        Ok(report)
    }

    /// Parse and describe a stored model's binary header.
    pub async fn inspect(&self, model: &str, all_metadata: bool) -> Result<ModelInfo> {
        use modelyard_inspect::FileFormat;

        let id = self.local_identifier(model)?;
        let ref_file = self.ctx.refs.read(&id)?;
        let path = crate::transport::entry_path(&self.ctx, &ref_file)?;

        match modelyard_inspect::detect_format(&path)
            .map_err(|e| StoreError::io_with_path(e, path.clone()))?
        {
            FileFormat::Gguf => {
                let header = modelyard_inspect::gguf::parse_file(&path)?;
                Ok(ModelInfo::Gguf {
                    version: header.version,
                    byte_order: header.byte_order,
                    architecture: header.architecture().map(str::to_string),
                    model_name: header.model_name().map(str::to_string),
                    tensor_count: header.tensor_count,
                    metadata: all_metadata.then(|| header.metadata_json()),
                    path,
                })
            }
            FileFormat::Safetensors => {
                let header = modelyard_inspect::safetensors::parse_file(&path)?;
                Ok(ModelInfo::Safetensors {
                    tensor_count: header.tensor_count(),
                    dtypes: header.dtypes().iter().map(|s| s.to_string()).collect(),
                    path,
                })
            }
            FileFormat::Unknown => {
                let size = std::fs::metadata(&path)
                    .map_err(|e| StoreError::io_with_path(e, path.clone()))?
                    .len();
                Ok(ModelInfo::Other { path, size })
            }
        }
    }

    /// Serialize the whole store into a `.tar.gz`.
    pub fn export(&self, output: &Path) -> Result<()> {
        archive::export(&self.ctx.layout, output)
    }

    /// Import a previously exported store, re-validating every blob digest.
    pub fn import(&self, input: &Path) -> Result<ImportReport> {
        archive::import(
            &self.ctx.layout,
            &self.ctx.blobs,
            &self.ctx.refs,
            &self.ctx.snapshots,
            input,
        )
    }

    /// Full-store garbage collection pass.
    pub fn sweep(&self) -> Result<GcReport> {
        gc::sweep(&self.ctx.layout, &self.ctx.blobs, &self.ctx.refs)
    }

    /// Re-hash one stored blob against its digest.
    pub fn verify_blob(&self, digest: &str) -> Result<bool> {
        self.ctx.blobs.verify(digest)
    }

    /// Identifier for local (already pulled) state. A pull routed through
    /// the HTTP fallback records its ref under that transport's namespace,
    /// so OCI references check both.
    fn local_identifier(&self, model: &str) -> Result<ModelIdentifier> {
        let id = identifier::parse(model, self.config.default_transport)?;
        if id.transport == TransportKind::Oci && !self.ctx.refs.exists(&id) {
            let fallback = id.with_transport(TransportKind::HttpArtifact);
            if self.ctx.refs.exists(&fallback) {
                return Ok(fallback);
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ModelStore) {
        let tmp = TempDir::new().unwrap();
        let store = ModelStore::new(StoreConfig::new(tmp.path().join("store"))).unwrap();
        (tmp, store)
    }

    fn write_local_model(dir: &Path, name: &str, content: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        format!("file://{}", path.display())
    }

    /// Minimal GGUF bytes for inspect tests.
    fn gguf_fixture() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GGUF");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        let key = b"general.architecture";
        bytes.extend_from_slice(&(key.len() as u64).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(&8u32.to_le_bytes());
        let value = b"llama";
        bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        bytes.extend_from_slice(value);
        bytes
    }

    #[tokio::test]
    async fn test_pull_list_remove_cycle() {
        let (tmp, store) = store();
        let model = write_local_model(tmp.path(), "m.gguf", &gguf_fixture());

        assert!(!store.exists(&model).await.unwrap());
        let ref_file = store.pull(&model).await.unwrap();
        assert_eq!(ref_file.identifier.transport, TransportKind::File);
        assert!(store.exists(&model).await.unwrap());

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);

        store.remove(&model).await.unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!store.exists(&model).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_is_idempotent_on_blob_count() {
        let (tmp, store) = store();
        let model = write_local_model(tmp.path(), "m.gguf", &gguf_fixture());

        store.pull(&model).await.unwrap();
        let blobs_after_first = store.ctx.blobs.list_digests().unwrap();
        store.pull(&model).await.unwrap();
        let blobs_after_second = store.ctx.blobs.list_digests().unwrap();
        assert_eq!(blobs_after_first, blobs_after_second);
    }

    #[tokio::test]
    async fn test_inspect_gguf() {
        let (tmp, store) = store();
        let model = write_local_model(tmp.path(), "m.gguf", &gguf_fixture());
        store.pull(&model).await.unwrap();

        let info = store.inspect(&model, false).await.unwrap();
        match info {
            ModelInfo::Gguf {
                architecture,
                tensor_count,
                byte_order,
                metadata,
                ..
            } => {
                assert_eq!(architecture.as_deref(), Some("llama"));
                assert_eq!(tensor_count, 0);
                assert!(byte_order.is_little());
                assert!(metadata.is_none());
            }
            other => panic!("expected GGUF info, got {other:?}"),
        }

        let full = store.inspect(&model, true).await.unwrap();
        match full {
            ModelInfo::Gguf { metadata, .. } => {
                let metadata = metadata.unwrap();
                assert_eq!(metadata["general.architecture"], "llama");
            }
            other => panic!("expected GGUF info, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inspect_unknown_format() {
        let (tmp, store) = store();
        let model = write_local_model(tmp.path(), "weights.bin", b"not a known format");
        store.pull(&model).await.unwrap();

        let info = store.inspect(&model, false).await.unwrap();
        assert!(matches!(info, ModelInfo::Other { size: 18, .. }));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_ref_not_found() {
        let (_tmp, store) = store();
        let err = store.remove("ollama://never-pulled").await.unwrap_err();
        assert!(matches!(err, StoreError::RefNotFound(_)));
    }

    #[tokio::test]
    async fn test_export_import_via_facade() {
        let (tmp, store) = store();
        let model = write_local_model(tmp.path(), "m.gguf", &gguf_fixture());
        store.pull(&model).await.unwrap();

        let archive_path = tmp.path().join("yard.tar.gz");
        store.export(&archive_path).unwrap();

        let dest_tmp = TempDir::new().unwrap();
        let dest = ModelStore::new(StoreConfig::new(dest_tmp.path().join("store"))).unwrap();
        let report = dest.import(&archive_path).unwrap();
        assert_eq!(report.refs_imported, 1);
        assert_eq!(dest.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_via_facade() {
        let (_tmp, store) = store();
        let report = store.sweep().unwrap();
        assert_eq!(report, GcReport::default());
    }
}
