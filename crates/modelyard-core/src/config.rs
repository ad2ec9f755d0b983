//! Store configuration.
//!
//! [`StoreConfig`] is a plain value constructed by the external
//! configuration collaborator and passed down by value; the core never
//! reads config files itself. Tunable constants live in const blocks.

use crate::identifier::TransportKind;
use crate::network::retry::RetryConfig;
use crate::transport::resolver::StrategyKind;
use std::path::PathBuf;
use std::time::Duration;

/// Network-related tunables.
pub struct NetworkTuning;

impl NetworkTuning {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    /// Blob downloads stream for a long time; only the connect phase is
    /// bounded tightly.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = concat!("modelyard/", env!("CARGO_PKG_VERSION"));
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
}

/// Store-layout tunables.
pub struct StoreTuning;

impl StoreTuning {
    /// Temp files under `tmp/` older than this are fair game for `sweep`.
    /// Generous on purpose: a slow pull of a large model must not have its
    /// in-flight file reaped.
    pub const TMP_REAP_AGE: Duration = Duration::from_secs(24 * 60 * 60);
}

/// Paths to credential material, loaded lazily by the transports.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// HuggingFace bearer-token file. `None` falls back to the conventional
    /// `~/.cache/huggingface/token`.
    pub huggingface_token_file: Option<PathBuf>,
    /// ModelScope token file, if any.
    pub modelscope_token_file: Option<PathBuf>,
    /// Bearer token per OCI registry host.
    pub registry_tokens: std::collections::HashMap<String, String>,
}

/// Configuration consumed by the store core, read-only.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the on-disk store.
    pub root: PathBuf,
    /// Transport used for model strings without a scheme prefix.
    pub default_transport: TransportKind,
    /// Credential file locations.
    pub auth: AuthConfig,
    /// Retry policy for transport-level network errors.
    pub retry: RetryConfig,
    /// Explicit OCI delivery strategy; short-circuits runtime probing.
    pub strategy_override: Option<StrategyKind>,
}

impl StoreConfig {
    /// Config with defaults for everything except the store root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_transport: TransportKind::Ollama,
            auth: AuthConfig::default(),
            retry: RetryConfig::default(),
            strategy_override: None,
        }
    }

    pub fn with_default_transport(mut self, transport: TransportKind) -> Self {
        self.default_transport = transport;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_strategy_override(mut self, strategy: StrategyKind) -> Self {
        self.strategy_override = Some(strategy);
        self
    }
}
