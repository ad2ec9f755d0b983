//! HuggingFace hub transport.
//!
//! Two resolution modes, tried in order of how the reference parses:
//! a repo reference (`hf://org/repo[:quant]`) goes through the `/v2/`
//! manifest API, which names the GGUF file and its blob digest; a direct
//! file reference (`hf://org/repo/file.gguf`) resolves the digest from the
//! raw git-LFS pointer. Weights stream with Range resume and verify against
//! the server digest.

use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, Reference, TransportKind};
use crate::network::with_retry;
use crate::store::refs::RefFile;
use crate::transport::hub::{
    parse_lfs_pointer, pull_files, read_token_file, ANCILLARY_FILES, HubFile,
};
use crate::transport::{
    cached_complete, commit_pull, entry_path, Transport, TransportContext,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const REGISTRY_BASE: &str = "https://huggingface.co";

/// Subset of the `/v2/<repo>/manifests/<tag>` response.
#[derive(Debug, Deserialize)]
struct RepoManifest {
    #[serde(rename = "ggufFile")]
    gguf_file: Option<ManifestFile>,
    #[serde(rename = "mmprojFile", default)]
    mmproj_file: Option<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    rfilename: String,
    /// Already `sha256:`-prefixed.
    #[serde(rename = "blobId")]
    blob_id: String,
}

pub struct HuggingFaceTransport {
    ctx: Arc<TransportContext>,
}

impl HuggingFaceTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn token(&self) -> Option<String> {
        let path = self
            .ctx
            .auth
            .huggingface_token_file
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache/huggingface/token")))?;
        read_token_file(&path)
    }

    /// `org/repo/file.gguf` parses with a slash in the organization or a
    /// file-like name; those resolve as direct files.
    fn is_file_reference(id: &ModelIdentifier) -> bool {
        id.name.ends_with(".gguf") || id.name.ends_with(".safetensors")
    }

    fn repo(id: &ModelIdentifier) -> String {
        id.repository()
    }

    /// The manifest API mirrors llama.cpp's `-hf` lookup; the quantization
    /// tag is case-insensitive upstream but canonically uppercase.
    fn manifest_tag(id: &ModelIdentifier) -> String {
        match &id.reference {
            Reference::Tag(tag) if tag != "latest" => tag.to_uppercase(),
            other => other.as_str().to_string(),
        }
    }

    async fn fetch_repo_manifest(&self, id: &ModelIdentifier, token: Option<&str>) -> Result<RepoManifest> {
        let url = format!(
            "{REGISTRY_BASE}/v2/{}/manifests/{}",
            Self::repo(id),
            Self::manifest_tag(id)
        );
        let mut headers = HeaderMap::new();
        // The ggufFile field is only served to llama.cpp-compatible agents.
        headers.insert(USER_AGENT, HeaderValue::from_static("llama-cpp"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = self.ctx.client.get(&url, Some(headers), token).await?;
        let manifest: RepoManifest = response.json().await.map_err(StoreError::from)?;
        debug!("Fetched repo manifest for {id}");
        Ok(manifest)
    }

    /// Digest of a single file from its raw git-LFS pointer.
    async fn fetch_file_digest(
        &self,
        repo: &str,
        file: &str,
        token: Option<&str>,
    ) -> Result<String> {
        let url = format!("{REGISTRY_BASE}/{repo}/raw/main/{file}");
        let response = self.ctx.client.get(&url, None, token).await?;
        let body = response.text().await.map_err(StoreError::from)?;
        parse_lfs_pointer(&body).ok_or_else(|| {
            StoreError::NotFound(format!("no sha256 recorded for {repo}/{file} upstream"))
        })
    }

    async fn plan(&self, id: &ModelIdentifier, token: Option<&str>) -> Result<Vec<HubFile>> {
        let mut files = Vec::new();

        if Self::is_file_reference(id) {
            let repo = id.organization.clone().ok_or_else(|| {
                StoreError::InvalidIdentifier {
                    reference: id.to_string(),
                    reason: "a direct file reference needs 'org/repo/file'".to_string(),
                }
            })?;
            let digest = with_retry(&self.ctx.retry, "checksum fetch", || {
                self.fetch_file_digest(&repo, &id.name, token)
            })
            .await?;
            files.push(HubFile::weight(&id.name, &crate::digest::with_prefix(&digest)));
        } else {
            let manifest = with_retry(&self.ctx.retry, "manifest fetch", || {
                self.fetch_repo_manifest(id, token)
            })
            .await?;
            let gguf = manifest.gguf_file.ok_or_else(|| {
                StoreError::NotFound(format!("{id} has no GGUF file in its repo manifest"))
            })?;
            files.push(HubFile::weight(&gguf.rfilename, &gguf.blob_id));
            if let Some(mmproj) = manifest.mmproj_file {
                files.push(HubFile::optional_weight(&mmproj.rfilename, &mmproj.blob_id));
            }
        }

        for name in ANCILLARY_FILES {
            files.push(HubFile::ancillary(name));
        }
        Ok(files)
    }

    fn resolve_base(id: &ModelIdentifier) -> String {
        let repo = if Self::is_file_reference(id) {
            id.organization.clone().unwrap_or_default()
        } else {
            Self::repo(id)
        };
        format!("{REGISTRY_BASE}/{repo}/resolve/main")
    }
}

#[async_trait]
impl Transport for HuggingFaceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HuggingFace
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        if let Some(cached) = cached_complete(&self.ctx, id) {
            info!("Using cached {id}");
            return Ok(cached);
        }

        let token = self.token();
        let files = self.plan(id, token.as_deref()).await?;
        let blobs = pull_files(
            &self.ctx,
            &Self::resolve_base(id),
            token.as_deref(),
            files,
        )
        .await?;
        commit_pull(&self.ctx, id, blobs, true).await
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
    use crate::identifier::parse;

    #[test]
    fn test_file_reference_detection() {
        let file_ref = parse("hf://org/repo/model.Q4_K_M.gguf", TransportKind::Ollama).unwrap();
        assert!(HuggingFaceTransport::is_file_reference(&file_ref));
        assert_eq!(file_ref.organization.as_deref(), Some("org/repo"));

        let repo_ref = parse("hf://org/repo", TransportKind::Ollama).unwrap();
        assert!(!HuggingFaceTransport::is_file_reference(&repo_ref));
    }

    #[test]
    fn test_manifest_tag_normalization() {
        let id = parse("hf://org/repo:q4_k_m", TransportKind::Ollama).unwrap();
        assert_eq!(HuggingFaceTransport::manifest_tag(&id), "Q4_K_M");

        let latest = parse("hf://org/repo", TransportKind::Ollama).unwrap();
        assert_eq!(HuggingFaceTransport::manifest_tag(&latest), "latest");
    }

    #[test]
    fn test_resolve_base() {
        let repo_ref = parse("hf://org/repo", TransportKind::Ollama).unwrap();
        assert_eq!(
            HuggingFaceTransport::resolve_base(&repo_ref),
            "https://huggingface.co/org/repo/resolve/main"
        );

        let file_ref = parse("hf://org/repo/m.gguf", TransportKind::Ollama).unwrap();
        assert_eq!(
            HuggingFaceTransport::resolve_base(&file_ref),
            "https://huggingface.co/org/repo/resolve/main"
        );
    }

    #[test]
    fn test_repo_manifest_parse() {
        let json = r#"{
            "ggufFile": {"rfilename": "tinyllama.Q4_K_M.gguf",
                         "blobId": "sha256:0123", "size": 668788096},
            "mmprojFile": {"rfilename": "mmproj.gguf", "blobId": "sha256:4567"}
        }"#;
        let manifest: RepoManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.gguf_file.unwrap().blob_id, "sha256:0123");
        assert_eq!(manifest.mmproj_file.unwrap().rfilename, "mmproj.gguf");
    }
}
