//! Transport resolution and OCI delivery-strategy selection.
//!
//! A model string resolves to (identifier, transport) by scheme prefix, or
//! by the configured default transport when bare. OCI references
//! additionally walk an ordered strategy chain (content-addressed artifact
//! mount, then image-based fallback, then plain HTTP download) gated by a
//! runtime capability probe that runs once per resolver and is cached. An
//! explicit override in the config short-circuits probing. An exhausted
//! chain is a fatal error, never a silent fallback.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::identifier::{self, ModelIdentifier, TransportKind};
use crate::transport::http_artifact::HttpArtifactTransport;
use crate::transport::huggingface::HuggingFaceTransport;
use crate::transport::modelscope::ModelScopeTransport;
use crate::transport::oci::OciTransport;
use crate::transport::ollama::OllamaTransport;
use crate::transport::url::UrlTransport;
use crate::transport::{ModelConverter, Transport, TransportContext};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Delivery mechanisms for OCI-registry content, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Registry artifact consumed directly from the store (mountable).
    ArtifactMount,
    /// Image-manifest pull for engines without artifact support.
    ImagePull,
    /// Plain HTTP download exposed as bind-mountable paths.
    HttpDownload,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::ArtifactMount => "artifact",
            StrategyKind::ImagePull => "image",
            StrategyKind::HttpDownload => "http",
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "artifact" => Ok(StrategyKind::ArtifactMount),
            "image" => Ok(StrategyKind::ImagePull),
            "http" => Ok(StrategyKind::HttpDownload),
            other => Err(StoreError::Config {
                message: format!("unknown strategy '{other}' (expected artifact, image, http)"),
            }),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the container runtime can mount. Filled in by the external runtime
/// collaborator through [`RuntimeProbe`].
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub artifact_mounts: bool,
    pub image_mounts: bool,
    /// Whether falling back to plain HTTP download-and-bind is acceptable.
    pub http_fallback: bool,
}

impl Default for ProbeResult {
    fn default() -> Self {
        Self {
            artifact_mounts: false,
            image_mounts: false,
            http_fallback: true,
        }
    }
}

/// The narrow callback into the runtime collaborator. Probing may shell out
/// to a container engine, so the resolver invokes it at most once.
pub trait RuntimeProbe: Send + Sync {
    fn probe(&self) -> ProbeResult;
}

/// Probe for environments without a container runtime: only the HTTP
/// fallback is viable.
pub struct NullProbe;

impl RuntimeProbe for NullProbe {
    fn probe(&self) -> ProbeResult {
        ProbeResult::default()
    }
}

/// A resolved model string, ready to act on.
pub struct Resolution {
    pub identifier: ModelIdentifier,
    pub transport: Arc<dyn Transport>,
    /// Chosen delivery strategy; set for OCI-family references only.
    pub strategy: Option<StrategyKind>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("identifier", &self.identifier)
            .field("transport", &self.transport.kind())
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Parses model strings and selects transports.
pub struct Resolver {
    ctx: Arc<TransportContext>,
    default_transport: TransportKind,
    strategy_override: Option<StrategyKind>,
    probe: Box<dyn RuntimeProbe>,
    probed: OnceLock<ProbeResult>,
    converter: Option<Arc<dyn ModelConverter>>,
}

impl Resolver {
    pub fn new(ctx: Arc<TransportContext>, config: &StoreConfig) -> Self {
        Self {
            ctx,
            default_transport: config.default_transport,
            strategy_override: config.strategy_override,
            probe: Box::new(NullProbe),
            probed: OnceLock::new(),
            converter: None,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn RuntimeProbe>) -> Self {
        self.probe = probe;
        self.probed = OnceLock::new();
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ModelConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    fn probe_result(&self) -> ProbeResult {
        *self.probed.get_or_init(|| {
            let result = self.probe.probe();
            debug!(
                "Runtime probe: artifact_mounts={} image_mounts={} http_fallback={}",
                result.artifact_mounts, result.image_mounts, result.http_fallback
            );
            result
        })
    }

    /// Walk the ordered chain and stop at the first viable strategy.
    fn select_strategy(&self, model: &str) -> Result<StrategyKind> {
        if let Some(explicit) = self.strategy_override {
            debug!("Strategy forced to {explicit} by configuration");
            return Ok(explicit);
        }

        let probe = self.probe_result();
        let chain = [
            (StrategyKind::ArtifactMount, probe.artifact_mounts),
            (StrategyKind::ImagePull, probe.image_mounts),
            (StrategyKind::HttpDownload, probe.http_fallback),
        ];
        for (strategy, viable) in chain {
            if viable {
                debug!("Selected {strategy} strategy for {model}");
                return Ok(strategy);
            }
        }

        Err(StoreError::NoViableTransport {
            reference: model.to_string(),
            tried: chain
                .iter()
                .map(|(s, _)| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Parse `model` and pick its transport.
    pub fn resolve(&self, model: &str) -> Result<Resolution> {
        let id = identifier::parse(model, self.default_transport)?;

        let (identifier, transport, strategy): (ModelIdentifier, Arc<dyn Transport>, _) =
            match id.transport {
                TransportKind::Ollama => {
                    (id, Arc::new(OllamaTransport::new(self.ctx.clone())), None)
                }
                TransportKind::HuggingFace => (
                    id,
                    Arc::new(HuggingFaceTransport::new(self.ctx.clone())),
                    None,
                ),
                TransportKind::ModelScope => (
                    id,
                    Arc::new(ModelScopeTransport::new(self.ctx.clone())),
                    None,
                ),
                TransportKind::Url | TransportKind::File => (
                    id,
                    Arc::new(UrlTransport::new(self.ctx.clone()).with_source(model)),
                    None,
                ),
                TransportKind::HttpArtifact => (
                    id,
                    Arc::new(HttpArtifactTransport::new(self.ctx.clone())),
                    Some(StrategyKind::HttpDownload),
                ),
                TransportKind::Oci => {
                    let strategy = self.select_strategy(model)?;
                    match strategy {
                        StrategyKind::HttpDownload => (
                            id.with_transport(TransportKind::HttpArtifact),
                            Arc::new(HttpArtifactTransport::new(self.ctx.clone())) as Arc<dyn Transport>,
                            Some(strategy),
                        ),
                        _ => {
                            let mut transport = OciTransport::new(self.ctx.clone());
                            if let Some(converter) = &self.converter {
                                transport = transport.with_converter(converter.clone());
                            }
                            (id, Arc::new(transport), Some(strategy))
                        }
                    }
                }
            };

        Ok(Resolution {
            identifier,
            transport,
            strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedProbe(ProbeResult);

    impl RuntimeProbe for FixedProbe {
        fn probe(&self) -> ProbeResult {
            self.0
        }
    }

    struct CountingProbe(std::sync::atomic::AtomicU32);

    impl RuntimeProbe for CountingProbe {
        fn probe(&self) -> ProbeResult {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ProbeResult {
                artifact_mounts: true,
                ..ProbeResult::default()
            }
        }
    }

    fn resolver(config_mutator: impl FnOnce(StoreConfig) -> StoreConfig) -> (TempDir, Resolver) {
        let tmp = TempDir::new().unwrap();
        let config = config_mutator(StoreConfig::new(tmp.path()));
        let ctx = Arc::new(TransportContext::new(&config).unwrap());
        (tmp, Resolver::new(ctx, &config))
    }

    #[test]
    fn test_scheme_selects_transport() {
        let (_tmp, resolver) = resolver(|c| c);
        assert_eq!(
            resolver.resolve("ollama://tinyllama").unwrap().transport.kind(),
            TransportKind::Ollama
        );
        assert_eq!(
            resolver.resolve("hf://org/repo").unwrap().transport.kind(),
            TransportKind::HuggingFace
        );
        assert_eq!(
            resolver
                .resolve("ms://org/repo/m.gguf")
                .unwrap()
                .transport
                .kind(),
            TransportKind::ModelScope
        );
        assert_eq!(
            resolver
                .resolve("file:///tmp/m.gguf")
                .unwrap()
                .transport
                .kind(),
            TransportKind::Url
        );
    }

    #[test]
    fn test_default_transport_for_bare_names() {
        let (_tmp, resolver) = resolver(|c| c.with_default_transport(TransportKind::HuggingFace));
        let resolution = resolver.resolve("org/repo").unwrap();
        assert_eq!(resolution.identifier.transport, TransportKind::HuggingFace);
    }

    #[test]
    fn test_oci_artifact_strategy_preferred() {
        let (_tmp, resolver) = resolver(|c| c);
        let resolver = resolver.with_probe(Box::new(FixedProbe(ProbeResult {
            artifact_mounts: true,
            image_mounts: true,
            http_fallback: true,
        })));

        let resolution = resolver.resolve("oci://quay.io/acme/granite").unwrap();
        assert_eq!(resolution.strategy, Some(StrategyKind::ArtifactMount));
        assert_eq!(resolution.identifier.transport, TransportKind::Oci);
    }

    #[test]
    fn test_oci_falls_back_to_http() {
        let (_tmp, resolver) = resolver(|c| c);
        // NullProbe: no mounts, http fallback allowed.
        let resolution = resolver.resolve("oci://quay.io/acme/granite").unwrap();
        assert_eq!(resolution.strategy, Some(StrategyKind::HttpDownload));
        // The identifier is re-routed so the ref lands under the fallback
        // transport's namespace.
        assert_eq!(
            resolution.identifier.transport,
            TransportKind::HttpArtifact
        );
    }

    #[test]
    fn test_exhausted_chain_is_fatal() {
        let (_tmp, resolver) = resolver(|c| c);
        let resolver = resolver.with_probe(Box::new(FixedProbe(ProbeResult {
            artifact_mounts: false,
            image_mounts: false,
            http_fallback: false,
        })));

        let err = resolver.resolve("oci://quay.io/acme/granite").unwrap_err();
        assert!(matches!(err, StoreError::NoViableTransport { .. }));
    }

    #[test]
    fn test_override_short_circuits_probe() {
        let (_tmp, resolver) =
            resolver(|c| c.with_strategy_override(StrategyKind::ImagePull));
        let counter = Arc::new(CountingProbe(std::sync::atomic::AtomicU32::new(0)));
        // A probe that would be counted if consulted.
        struct SharedProbe(Arc<CountingProbe>);
        impl RuntimeProbe for SharedProbe {
            fn probe(&self) -> ProbeResult {
                self.0.probe()
            }
        }
        let resolver = resolver.with_probe(Box::new(SharedProbe(counter.clone())));

        let resolution = resolver.resolve("oci://quay.io/acme/granite").unwrap();
        assert_eq!(resolution.strategy, Some(StrategyKind::ImagePull));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_probe_runs_once() {
        let (_tmp, resolver) = resolver(|c| c);
        let counter = Arc::new(CountingProbe(std::sync::atomic::AtomicU32::new(0)));
        struct SharedProbe(Arc<CountingProbe>);
        impl RuntimeProbe for SharedProbe {
            fn probe(&self) -> ProbeResult {
                self.0.probe()
            }
        }
        let resolver = resolver.with_probe(Box::new(SharedProbe(counter.clone())));

        resolver.resolve("oci://quay.io/acme/one").unwrap();
        resolver.resolve("oci://quay.io/acme/two").unwrap();
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strategy_round_trip() {
        for strategy in [
            StrategyKind::ArtifactMount,
            StrategyKind::ImagePull,
            StrategyKind::HttpDownload,
        ] {
            let parsed: StrategyKind = strategy.as_str().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert!("bogus".parse::<StrategyKind>().is_err());
    }
}
