//! Model identifiers and model-string parsing.
//!
//! A model string like `ollama://tinyllama`, `hf://org/repo:tag`, or
//! `oci://registry.acme.org/ns/repo@sha256:...` parses into a structural
//! [`ModelIdentifier`]. The scheme prefix selects the transport; without one
//! the configured default transport applies.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use url::Url;

/// The registry/source kind a model identity belongs to.
///
/// The serialized tokens are part of the stable on-disk layout
/// (`refs/<transport>/...`) and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "oci")]
    Oci,
    /// The ollama model hub (Docker-style manifests on registry.ollama.ai).
    #[serde(rename = "hub")]
    Ollama,
    /// The HuggingFace hub API.
    #[serde(rename = "hub_alt")]
    HuggingFace,
    #[serde(rename = "modelscope")]
    ModelScope,
    /// Plain `http(s)://` single-file model.
    #[serde(rename = "url")]
    Url,
    /// Local `file://` source, referenced rather than copied.
    #[serde(rename = "file")]
    File,
    /// Registry blobs fetched over plain HTTP and exposed as bind-mountable
    /// paths; the fallback when neither artifact nor image mounts work.
    #[serde(rename = "http_artifact")]
    HttpArtifact,
}

impl TransportKind {
    /// On-disk directory token under `refs/` and `snapshots/`.
    pub fn token(self) -> &'static str {
        match self {
            TransportKind::Oci => "oci",
            TransportKind::Ollama => "hub",
            TransportKind::HuggingFace => "hub_alt",
            TransportKind::ModelScope => "modelscope",
            TransportKind::Url => "url",
            TransportKind::File => "file",
            TransportKind::HttpArtifact => "http_artifact",
        }
    }

    /// Parse an on-disk token back into a kind.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "oci" => TransportKind::Oci,
            "hub" => TransportKind::Ollama,
            "hub_alt" => TransportKind::HuggingFace,
            "modelscope" => TransportKind::ModelScope,
            "url" => TransportKind::Url,
            "file" => TransportKind::File,
            "http_artifact" => TransportKind::HttpArtifact,
            _ => return None,
        })
    }

    /// The canonical scheme used when displaying identifiers.
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Oci => "oci",
            TransportKind::Ollama => "ollama",
            TransportKind::HuggingFace => "hf",
            TransportKind::ModelScope => "ms",
            TransportKind::Url => "https",
            TransportKind::File => "file",
            TransportKind::HttpArtifact => "http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// A tag or digest pinning one version of a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reference {
    Tag(String),
    /// `sha256:<hex>` manifest digest.
    Digest(String),
}

impl Reference {
    pub fn latest() -> Self {
        Reference::Tag("latest".to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(t) => t,
            Reference::Digest(d) => d,
        }
    }

    /// Filesystem-safe form used for ref filenames and snapshot dirs
    /// (`sha256:` digests carry a colon).
    pub fn as_filename(&self) -> String {
        self.as_str().replace([':', '/'], "-")
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structural identity of a model: transport, optional host/organization,
/// name, and a tag-or-digest reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentifier {
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub organization: Option<String>,
    pub name: String,
    pub reference: Reference,
}

impl ModelIdentifier {
    /// Directory component under `refs/<transport>/`. Identifiers without an
    /// organization store under their own name, so the layout stays uniform.
    pub fn organization_dir(&self) -> &str {
        self.organization.as_deref().unwrap_or(&self.name)
    }

    /// Same identity routed through a different transport (used when the
    /// strategy chain falls back, e.g. OCI -> HTTP artifact).
    pub fn with_transport(&self, transport: TransportKind) -> Self {
        Self {
            transport,
            ..self.clone()
        }
    }

    /// `host/org/name` repository path for registry URLs.
    pub fn repository(&self) -> String {
        match &self.organization {
            Some(org) => format!("{}/{}", org, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.transport.scheme())?;
        if let Some(host) = &self.host {
            write!(f, "{host}/")?;
        }
        if let Some(org) = &self.organization {
            write!(f, "{org}/")?;
        }
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            Reference::Digest(digest) => write!(f, "{}@{}", self.name, digest),
        }
    }
}

/// Scheme prefixes in match order; longer aliases first where they overlap.
const PREFIX_TABLE: &[(&str, TransportKind)] = &[
    ("huggingface://", TransportKind::HuggingFace),
    ("hf://", TransportKind::HuggingFace),
    ("hf.co/", TransportKind::HuggingFace),
    ("modelscope://", TransportKind::ModelScope),
    ("ms://", TransportKind::ModelScope),
    ("modelscope.cn/", TransportKind::ModelScope),
    ("ollama://", TransportKind::Ollama),
    ("ollama.com/library/", TransportKind::Ollama),
    ("oci://", TransportKind::Oci),
    ("docker://", TransportKind::Oci),
    ("http://", TransportKind::Url),
    ("https://", TransportKind::Url),
    ("file://", TransportKind::File),
];

/// Parse a model string into an identifier.
///
/// `default_transport` applies when the string carries no scheme prefix.
pub fn parse(model: &str, default_transport: TransportKind) -> Result<ModelIdentifier> {
    if model.trim().is_empty() {
        return Err(StoreError::InvalidIdentifier {
            reference: model.to_string(),
            reason: "empty model reference".to_string(),
        });
    }

    let (kind, rest) = match PREFIX_TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
    {
        Some((prefix, kind)) => match kind {
            // URL-shaped transports keep the scheme; everything else drops it.
            TransportKind::Url | TransportKind::File => (*kind, model),
            _ => (*kind, &model[prefix.len()..]),
        },
        None => (default_transport, model),
    };

    match kind {
        TransportKind::Url | TransportKind::File => parse_url(model, kind, rest),
        TransportKind::Oci | TransportKind::HttpArtifact => parse_oci(model, kind, rest),
        TransportKind::Ollama => Ok(parse_hub(kind, rest, Some("library"))),
        TransportKind::HuggingFace | TransportKind::ModelScope => Ok(parse_hub(kind, rest, None)),
    }
}

/// `name[:tag]`, `org/name[:tag]` hub references.
fn parse_hub(kind: TransportKind, rest: &str, default_org: Option<&str>) -> ModelIdentifier {
    let (path, tag) = match rest.split_once(':') {
        Some((path, tag)) if !tag.is_empty() => (path, tag.to_string()),
        _ => (rest, "latest".to_string()),
    };

    let (organization, name) = match path.rsplit_once('/') {
        Some((org, name)) => (Some(org.trim_start_matches('/').to_string()), name),
        None => (default_org.map(str::to_string), path),
    };

    ModelIdentifier {
        transport: kind,
        host: None,
        organization,
        name: name.to_string(),
        reference: Reference::Tag(tag),
    }
}

/// `registry/ns[/ns...]/repo[:tag|@sha256:hex]` OCI references.
fn parse_oci(original: &str, kind: TransportKind, rest: &str) -> Result<ModelIdentifier> {
    let (path, reference) = if let Some((path, digest)) = rest.split_once('@') {
        if !digest.starts_with("sha256:") {
            return Err(StoreError::InvalidIdentifier {
                reference: original.to_string(),
                reason: format!("unsupported digest algorithm in '{digest}'"),
            });
        }
        (path, Reference::Digest(digest.to_string()))
    } else {
        // A colon in the final segment is a tag; earlier colons would be a port.
        match rest.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') && !tag.is_empty() => {
                (path, Reference::Tag(tag.to_string()))
            }
            _ => (rest, Reference::latest()),
        }
    };

    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(StoreError::InvalidIdentifier {
            reference: original.to_string(),
            reason: "an OCI reference must name a registry, e.g. \
                     'oci://registry.acme.org/ns/repo:tag'"
                .to_string(),
        });
    }

    let host = segments.remove(0).to_string();
    let name = segments.pop().expect("at least one segment remains");
    let organization = if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    };

    Ok(ModelIdentifier {
        transport: kind,
        host: Some(host),
        organization,
        name: name.to_string(),
        reference,
    })
}

/// `http(s)://` and `file://` single-file references.
fn parse_url(original: &str, kind: TransportKind, rest: &str) -> Result<ModelIdentifier> {
    let parsed = Url::parse(rest).map_err(|e| StoreError::InvalidIdentifier {
        reference: original.to_string(),
        reason: e.to_string(),
    })?;

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let name = segments.last().copied().unwrap_or_default().to_string();
    if name.is_empty() {
        return Err(StoreError::InvalidIdentifier {
            reference: original.to_string(),
            reason: "URL has no file component".to_string(),
        });
    }

    let organization = if segments.len() > 1 {
        Some(segments[..segments.len() - 1].join("/"))
    } else {
        None
    };

    Ok(ModelIdentifier {
        transport: kind,
        host: parsed.host_str().map(str::to_string),
        organization,
        name,
        reference: Reference::latest(),
    })
}
