//! ModelScope hub transport.
//!
//! The second hub ecosystem, same shape as HuggingFace with variant
//! endpoints: digests come from the repo-files metadata API
//! (`Data.MetaContent.Sha256`), bytes from `resolve/master`. References are
//! direct files: `ms://org/repo/file.gguf`.

use crate::error::{Result, StoreError};
use crate::identifier::{ModelIdentifier, TransportKind};
use crate::network::with_retry;
use crate::store::refs::RefFile;
use crate::transport::hub::{pull_files, read_token_file, ANCILLARY_FILES, HubFile};
use crate::transport::{cached_complete, commit_pull, entry_path, Transport, TransportContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const REGISTRY_BASE: &str = "https://modelscope.cn";

#[derive(Debug, Deserialize)]
struct MetaResponse {
    #[serde(rename = "Data", default)]
    data: Option<MetaData>,
}

#[derive(Debug, Deserialize)]
struct MetaData {
    #[serde(rename = "MetaContent", default)]
    meta_content: Option<MetaContent>,
}

#[derive(Debug, Deserialize)]
struct MetaContent {
    #[serde(rename = "Sha256", default)]
    sha256: Option<String>,
}

pub struct ModelScopeTransport {
    ctx: Arc<TransportContext>,
}

impl ModelScopeTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn token(&self) -> Option<String> {
        let path = self.ctx.auth.modelscope_token_file.clone()?;
        read_token_file(&path)
    }

    fn repo(id: &ModelIdentifier) -> Result<String> {
        id.organization
            .clone()
            .ok_or_else(|| StoreError::InvalidIdentifier {
                reference: id.to_string(),
                reason: "a ModelScope reference needs 'org/repo/file'".to_string(),
            })
    }

    async fn fetch_file_digest(&self, repo: &str, file: &str) -> Result<String> {
        let url = format!(
            "{REGISTRY_BASE}/api/v1/models/{repo}/repo/raw?Revision=master&FilePath={file}&Needmeta=true"
        );
        let response = self.ctx.client.get(&url, None, None).await?;
        let meta: MetaResponse = response.json().await.map_err(StoreError::from)?;

        meta.data
            .and_then(|d| d.meta_content)
            .and_then(|c| c.sha256)
            .ok_or_else(|| {
                StoreError::NotFound(format!("no sha256 recorded for {repo}/{file} upstream"))
            })
            .map(|hex| {
                debug!("Resolved {repo}/{file} to sha256:{hex}");
                hex
            })
    }
}

#[async_trait]
impl Transport for ModelScopeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ModelScope
    }

    async fn pull(&self, id: &ModelIdentifier) -> Result<RefFile> {
        if let Some(cached) = cached_complete(&self.ctx, id) {
            info!("Using cached {id}");
            return Ok(cached);
        }

        let repo = Self::repo(id)?;
        let digest = with_retry(&self.ctx.retry, "checksum fetch", || {
            self.fetch_file_digest(&repo, &id.name)
        })
        .await?;

        let mut files = vec![HubFile::weight(
            &id.name,
            &crate::digest::with_prefix(&digest),
        )];
        for name in ANCILLARY_FILES {
            files.push(HubFile::ancillary(name));
        }

        let resolve_base = format!("{REGISTRY_BASE}/{repo}/resolve/master");
        let token = self.token();
        let blobs = pull_files(&self.ctx, &resolve_base, token.as_deref(), files).await?;
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
    fn test_meta_response_parse() {
        let json = r#"{"Code": 200, "Data": {"MetaContent": {"Sha256": "0123abcd"}}}"#;
        let meta: MetaResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            meta.data.unwrap().meta_content.unwrap().sha256.as_deref(),
            Some("0123abcd")
        );
    }

    #[test]
    fn test_meta_response_missing_checksum() {
        let json = r#"{"Code": 200, "Data": {}}"#;
        let meta: MetaResponse = serde_json::from_str(json).unwrap();
        assert!(meta.data.unwrap().meta_content.is_none());
    }

    #[test]
    fn test_repo_extraction() {
        let id = parse("ms://Qwen/Qwen3-GGUF/model.gguf", TransportKind::Ollama).unwrap();
        assert_eq!(
            ModelScopeTransport::repo(&id).unwrap(),
            "Qwen/Qwen3-GGUF"
        );

        let bare = parse("ms://standalone", TransportKind::Ollama).unwrap();
        assert!(ModelScopeTransport::repo(&bare).is_err());
    }
}
