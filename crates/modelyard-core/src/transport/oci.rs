//! OCI registry transport.
//!
//! Speaks the registry v2 protocol directly: manifest GET/PUT, blob
//! GET/HEAD and the two-step POST+PUT upload. Accepts both image and
//! artifact manifests; layer media types and `org.cnai.model.*` annotations
//! decide each blob's role and logical path. Every layer download is
//! verified against the manifest-declared digest and a mismatch is fatal.

use crate::digest;
use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::network::download::fetch_to_blob;
use crate::network::with_retry;
use crate::store::refs::{BlobRole, RefBlob, RefFile};
use crate::transport::{
    cached_complete, commit_pull, entry_path, ModelConverter, Transport, TransportContext,
    ENTRY_FILE_NAME,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Manifest media types this transport understands, in Accept order.
pub const MANIFEST_ACCEPT: &[&str] = &[
    "application/vnd.oci.artifact.manifest.v1+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// CNAI model artifact type (CloudNativeAI model-spec).
pub const ARTIFACT_TYPE_MODEL: &str = "application/vnd.cnai.model.manifest.v1+json";
/// Media type we emit for raw weight layers (CNAI model-spec).
pub const MEDIA_TYPE_WEIGHT_RAW: &str = "application/vnd.cncf.model.weight.v1.raw";
const MEDIA_TYPE_EMPTY_CONFIG: &str = "application/vnd.cnai.model.config.v1+json";

/// Layer annotation naming the file path inside the model.
pub const ANNOTATION_FILEPATH: &str = "org.cnai.model.filepath";
/// Layer annotation carrying per-file metadata JSON.
pub const ANNOTATION_FILE_METADATA: &str = "org.cnai.model.file.metadata+json";

/// A content descriptor as it appears in manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub annotations: Option<HashMap<String, String>>,
}

/// The manifest subset this transport consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none", default)]
    pub media_type: Option<String>,
    #[serde(rename = "artifactType", skip_serializing_if = "Option::is_none", default)]
    pub artifact_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

fn default_schema_version() -> u32 {
    2
}

impl Manifest {
    /// Artifact-typed manifests carry model files directly; image manifests
    /// need the mount-or-fallback dance.
    pub fn is_artifact(&self) -> bool {
        self.artifact_type.is_some()
            || self
                .media_type
                .as_deref()
                .map(|m| m.contains("artifact"))
                .unwrap_or(false)
            || self.layers.iter().any(|l| {
                l.annotations
                    .as_ref()
                    .map(|a| a.contains_key(ANNOTATION_FILEPATH))
                    .unwrap_or(false)
            })
    }

    /// Reject manifest kinds we cannot consume (indexes, foreign types).
    pub fn check_media_type(&self) -> Result<()> {
        if let Some(media_type) = &self.media_type {
            let known = MANIFEST_ACCEPT.contains(&media_type.as_str())
                || media_type == ARTIFACT_TYPE_MODEL;
            if !known {
                return Err(StoreError::UnsupportedMediaType(media_type.clone()));
            }
        }
        Ok(())
    }
}

/// Map a layer descriptor to its role and snapshot name.
fn classify_layer(layer: &Descriptor, index: usize, layer_total: usize) -> (BlobRole, String) {
    if let Some(path) = layer
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_FILEPATH))
    {
        return (BlobRole::File, path.clone());
    }

    if layer.media_type.ends_with(".gguf") || layer.media_type.contains("model") {
        let name = if layer_total == 1 {
            ENTRY_FILE_NAME.to_string()
        } else {
            format!("model-{index}.file")
        };
        return (BlobRole::File, name);
    }

    (BlobRole::Layer, format!("layer-{index}"))
}

/// Minimal registry v2 client for one repository.
pub struct RegistryClient {
    pub registry: String,
    pub repository: String,
    pub reference: String,
    pub token: Option<String>,
}

impl RegistryClient {
    pub fn for_identifier(id: &ModelIdentifier, ctx: &TransportContext) -> Result<Self> {
        let registry = id.host.clone().ok_or_else(|| StoreError::InvalidIdentifier {
            reference: id.to_string(),
            reason: "an OCI reference must name a registry".to_string(),
        })?;
        let token = ctx.auth.registry_tokens.get(&registry).cloned();
        Ok(Self {
            repository: id.repository(),
            reference: id.reference.as_str().to_string(),
            registry,
            token,
        })
    }

    fn base_url(&self) -> String {
        format!(
            "{}://{}/v2/{}",
            registry_scheme(&self.registry),
            self.registry,
            self.repository
        )
    }

    fn manifest_url(&self) -> String {
        format!("{}/manifests/{}", self.base_url(), self.reference)
    }

    fn blob_url(&self, digest: &str) -> String {
        format!("{}/blobs/{}", self.base_url(), digest)
    }

    fn accept_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&MANIFEST_ACCEPT.join(",")).expect("static header"),
        );
        headers
    }

    /// Fetch and parse the manifest; returns the parsed form, its digest,
    /// and the raw bytes (stored as the `manifest` blob).
    pub async fn fetch_manifest(&self, ctx: &TransportContext) -> Result<(Manifest, String, Vec<u8>)> {
        let url = self.manifest_url();
        let response = ctx
            .client
            .get(&url, Some(Self::accept_headers()), self.token.as_deref())
            .await?;

        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = response.bytes().await.map_err(StoreError::from)?.to_vec();
        let manifest_digest =
            header_digest.unwrap_or_else(|| digest::with_prefix(&digest::hash_bytes(&raw)));

        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::UnsupportedMediaType(format!("unparsable manifest: {e}")))?;
        manifest.check_media_type()?;

        debug!(
            "Fetched manifest {manifest_digest} for {}/{}@{}",
            self.registry, self.repository, self.reference
        );
        Ok((manifest, manifest_digest, raw))
    }

    pub async fn blob_exists(&self, ctx: &TransportContext, digest: &str) -> Result<bool> {
        let url = self.blob_url(digest);
        let mut request = ctx.client.inner().head(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(StoreError::from)?;
        Ok(response.status().is_success())
    }

    /// Two-step upload: POST an upload session, PUT the content with its
    /// digest. Skipped entirely when the remote already has the blob.
    pub async fn upload_blob(&self, ctx: &TransportContext, path: &std::path::Path, digest: &str) -> Result<()> {
        if self.blob_exists(ctx, digest).await? {
            debug!("Remote already has {digest}");
            return Ok(());
        }

        let start_url = format!("{}/blobs/uploads/", self.base_url());
        let mut request = ctx.client.inner().post(&start_url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(StoreError::from)?;
        let response = crate::network::HttpClient::check_status(response, &start_url)?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::Network {
                message: format!("{start_url} returned no upload location"),
                source: None,
            })?;
        let upload_url = absolutize(&self.registry, location);
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{upload_url}{separator}digest={digest}");

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StoreError::io_with_path(e, path.to_path_buf()))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::io_with_path(e, path.to_path_buf()))?
            .len();

        let mut request = ctx
            .client
            .inner()
            .put(&put_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(tokio_stream(file)));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(StoreError::from)?;
        crate::network::HttpClient::check_status(response, &put_url)?;

        info!("Uploaded blob {digest} to {}", self.repository);
        Ok(())
    }

    pub async fn put_manifest(&self, ctx: &TransportContext, manifest: &Manifest) -> Result<()> {
        let url = self.manifest_url();
        let body = serde_json::to_vec(manifest)?;
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| MANIFEST_ACCEPT[1].to_string());

        let mut request = ctx
            .client
            .inner()
            .put(&url)
            .header(CONTENT_TYPE, media_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(StoreError::from)?;
        crate::network::HttpClient::check_status(response, &url)?;

        info!("Pushed manifest for {}/{}", self.repository, self.reference);
        Ok(())
    }
}

/// Local registries conventionally run without TLS.
fn registry_scheme(registry: &str) -> &'static str {
    if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}

fn absolutize(registry: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}://{registry}{location}", registry_scheme(registry))
    }
}

fn tokio_stream(
    file: tokio::fs::File,
) -> impl futures::Stream<Item = std::io::Result<bytes::Bytes>> {
    tokio_util::io::ReaderStream::new(file)
}

/// Transport for OCI registries (and, with a different kind token, the
/// plain-HTTP artifact fallback which shares the wire protocol).
pub struct OciTransport {
    ctx: Arc<TransportContext>,
    kind: TransportKind,
    converter: Option<Arc<dyn ModelConverter>>,
}

impl OciTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            ctx,
            kind: TransportKind::Oci,
            converter: None,
        }
    }

    pub(crate) fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ModelConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    async fn pull_blobs(
        &self,
        client: &RegistryClient,
        manifest: &Manifest,
        raw_manifest: &[u8],
    ) -> Result<Vec<RefBlob>> {
        let ctx = &self.ctx;
        let mut blobs = Vec::new();

        let manifest_blob = ctx.blobs.put_bytes(raw_manifest)?;
        blobs.push(RefBlob::new(
            &manifest_blob.digest,
            manifest_blob.size,
            BlobRole::Manifest,
            "manifest.json",
        ));

        if let Some(config) = &manifest.config {
            if !ctx.blobs.has(&config.digest) {
                let config_url = client.blob_url(&config.digest);
                with_retry(&ctx.retry, "config download", || {
                    fetch_to_blob(
                        &ctx.client,
                        &ctx.blobs,
                        &config_url,
                        None,
                        client.token.as_deref(),
                        Some(&config.digest),
                        None,
                    )
                })
                .await?;
            }
            blobs.push(RefBlob::new(
                digest::strip_prefix(&config.digest),
                config.size,
                BlobRole::Config,
                "config.json",
            ));
        }

        let layer_total = manifest.layers.len();
        for (index, layer) in manifest.layers.iter().enumerate() {
            let (role, logical_path) = classify_layer(layer, index, layer_total);
            if !ctx.blobs.has(&layer.digest) {
                let layer_url = client.blob_url(&layer.digest);
                with_retry(&ctx.retry, "layer download", || {
                    fetch_to_blob(
                        &ctx.client,
                        &ctx.blobs,
                        &layer_url,
                        None,
                        client.token.as_deref(),
                        Some(&layer.digest),
                        None,
                    )
                })
                .await?;
            } else {
                debug!("Layer {} already cached", layer.digest);
            }
            blobs.push(RefBlob::new(
                digest::strip_prefix(&layer.digest),
                layer.size,
                role,
                logical_path,
            ));
        }

        Ok(blobs)
    }

    /// Stage push content, converting safetensors weights to GGUF when a
    /// converter hook was supplied.
    async fn staged_layers(&self, source: &RefFile) -> Result<Vec<(PathBuf, String, u64, String)>> {
        let ctx = &self.ctx;
        let mut staged = Vec::new();

        for blob in source.blobs.iter().filter(|b| b.role == BlobRole::File) {
            let path = match &blob.source_path {
                Some(source_path) => source_path.clone(),
                None => ctx.blobs.path(blob.digest_hex()),
            };

            let (path, logical_path) = if blob.logical_path.ends_with(".safetensors") {
                match &self.converter {
                    Some(converter) => {
                        let work_dir = ctx.layout.tmp_dir();
                        let converted = converter.convert(&path, &work_dir).await?;
                        let name = converted
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| blob.logical_path.clone());
                        (converted, name)
                    }
                    None => (path, blob.logical_path.clone()),
                }
            } else {
                (path, blob.logical_path.clone())
            };

            let digest_hex = digest::hash_file(&path)?;
            let size = std::fs::metadata(&path)
                .map_err(|e| StoreError::io_with_path(e, path.clone()))?
                .len();
            staged.push((path, digest::with_prefix(&digest_hex), size, logical_path));
        }

        if staged.is_empty() {
            return Err(StoreError::Config {
                message: format!("{} has no files to push", source.identifier),
            });
        }
        Ok(staged)
    }
}

#[async_trait]
impl Transport for OciTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        if let Some(cached) = cached_complete(&self.ctx, id) {
            info!("Using cached {id}");
            return Ok(cached);
        }

        let client = RegistryClient::for_identifier(id, &self.ctx)?;
        let ctx = &self.ctx;
        let (manifest, _digest, raw) =
            with_retry(&ctx.retry, "manifest fetch", || client.fetch_manifest(ctx)).await?;

        let blobs = self.pull_blobs(&client, &manifest, &raw).await?;
        commit_pull(ctx, id, blobs, true).await
    }

    async fn push(&self, source: &RefFile, target: &ModelIdentifier) -> Result<()> {
        let client = RegistryClient::for_identifier(target, &self.ctx)?;
        let ctx = &self.ctx;

        let staged = self.staged_layers(source).await?;

        let mut layers = Vec::new();
        for (path, digest, size, logical_path) in &staged {
            with_retry(&ctx.retry, "blob upload", || {
                client.upload_blob(ctx, path, digest)
            })
            .await?;

            let media_type = if logical_path.ends_with(".gguf") || *logical_path == ENTRY_FILE_NAME
            {
                MEDIA_TYPE_WEIGHT_RAW
            } else {
                "application/octet-stream"
            };
            let mut annotations = HashMap::new();
            annotations.insert(ANNOTATION_FILEPATH.to_string(), logical_path.clone());
            layers.push(Descriptor {
                media_type: media_type.to_string(),
                digest: digest.clone(),
                size: *size,
                annotations: Some(annotations),
            });
        }

        // Empty JSON config object, uploaded like any blob.
        let config_bytes = b"{}";
        let config_blob = ctx.blobs.put_bytes(config_bytes)?;
        let config_digest = digest::with_prefix(&config_blob.digest);
        with_retry(&ctx.retry, "config upload", || {
            client.upload_blob(ctx, &config_blob.path, &config_digest)
        })
        .await?;

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MANIFEST_ACCEPT[1].to_string()),
            artifact_type: Some(ARTIFACT_TYPE_MODEL.to_string()),
            config: Some(Descriptor {
                media_type: MEDIA_TYPE_EMPTY_CONFIG.to_string(),
                digest: config_digest,
                size: config_bytes.len() as u64,
                annotations: None,
            }),
            layers,
        };
        with_retry(&ctx.retry, "manifest push", || {
            client.put_manifest(ctx, &manifest)
        })
        .await
    }

    async fn exists(&self, id: &ModelIdentifier) -> Result<bool> {
        Ok(cached_complete(&self.ctx, id).is_some())
    }

    async fn list_entry(&self, id: &ModelIdentifier) -> Result<PathBuf> {
        let ref_file = self.ctx.refs.read(id)?;
        entry_path(&self.ctx, &ref_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str, digest: &str, annotations: Option<Vec<(&str, &str)>>) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size: 1,
            annotations: annotations.map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
        }
    }

    #[test]
    fn test_manifest_parse_image() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json",
                       "digest": "sha256:aa", "size": 2},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar",
                        "digest": "sha256:bb", "size": 10}]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        manifest.check_media_type().unwrap();
        assert!(!manifest.is_artifact());
        assert_eq!(manifest.layers.len(), 1);
    }

    #[test]
    fn test_manifest_artifact_detection() {
        let json = format!(
            r#"{{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "artifactType": "{ARTIFACT_TYPE_MODEL}",
            "layers": [{{"mediaType": "{MEDIA_TYPE_WEIGHT_RAW}",
                        "digest": "sha256:cc", "size": 10,
                        "annotations": {{"{ANNOTATION_FILEPATH}": "weights.gguf"}}}}]
        }}"#
        );
        let manifest: Manifest = serde_json::from_str(&json).unwrap();
        assert!(manifest.is_artifact());
    }

    #[test]
    fn test_unknown_media_type_rejected() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "layers": []
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        let err = manifest.check_media_type().unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedMediaType(_)));
    }

    #[test]
    fn test_classify_layer_filepath_annotation_wins() {
        let layer = descriptor(
            "application/octet-stream",
            "sha256:dd",
            Some(vec![(ANNOTATION_FILEPATH, "weights/model.gguf")]),
        );
        let (role, path) = classify_layer(&layer, 0, 1);
        assert_eq!(role, BlobRole::File);
        assert_eq!(path, "weights/model.gguf");
    }

    #[test]
    fn test_classify_layer_gguf_media_type() {
        let layer = descriptor(MEDIA_TYPE_WEIGHT_RAW, "sha256:ee", None);
        let (role, path) = classify_layer(&layer, 0, 1);
        assert_eq!(role, BlobRole::File);
        assert_eq!(path, ENTRY_FILE_NAME);
    }

    #[test]
    fn test_classify_layer_opaque() {
        let layer = descriptor("application/vnd.oci.image.layer.v1.tar+gzip", "sha256:ff", None);
        let (role, path) = classify_layer(&layer, 2, 4);
        assert_eq!(role, BlobRole::Layer);
        assert_eq!(path, "layer-2");
    }

    #[test]
    fn test_absolutize_location() {
        assert_eq!(
            absolutize("quay.io", "/v2/acme/repo/blobs/uploads/xyz"),
            "https://quay.io/v2/acme/repo/blobs/uploads/xyz"
        );
        assert_eq!(
            absolutize("quay.io", "https://cdn.quay.io/upload/xyz"),
            "https://cdn.quay.io/upload/xyz"
        );
    }
}
