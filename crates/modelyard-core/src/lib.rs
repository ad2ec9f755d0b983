//! Modelyard Core - content-addressed storage and registry transports for
//! AI model artifacts.
//!
//! Models are managed the way a container runtime manages images: a model
//! name resolves against one of several registry transports (OCI, the
//! ollama hub, HuggingFace-style hubs, plain URLs and local files),
//! content lands in a deduplicated blob store keyed by sha256, and a
//! queryable local view (refs, snapshots, inspection) is exposed to
//! whatever mounts the files into a runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelyard_core::{ModelStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> modelyard_core::Result<()> {
//!     let store = ModelStore::new(StoreConfig::new("/var/lib/modelyard"))?;
//!
//!     let ref_file = store.pull("ollama://tinyllama").await?;
//!     println!("pulled {} blobs", ref_file.blobs.len());
//!
//!     let entry = store.list_entry("ollama://tinyllama").await?;
//!     println!("mount {}", entry.display());
//!
//!     Ok(())
//! }
//! ```
//!
//! Concurrency model: multiple processes may share one store root. Atomic
//! rename is the only synchronization primitive; blobs and refs are
//! written to temp files and renamed into place, so readers never observe
//! partial state. Concurrent pulls of the same content may both download;
//! the blob store converges them by digest afterwards.

pub mod config;
pub mod digest;
pub mod error;
pub mod facade;
pub mod identifier;
pub mod network;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::{AuthConfig, StoreConfig};
pub use error::{ErrorKind, Result, StoreError};
pub use facade::{ModelInfo, ModelStore};
pub use identifier::{ModelIdentifier, Reference, TransportKind};
pub use network::RetryConfig;
pub use store::archive::ImportReport;
pub use store::blob::{Blob, BlobStore};
pub use store::gc::GcReport;
pub use store::refs::{BlobRole, RefBlob, RefFile};
pub use store::StoreLayout;
pub use transport::resolver::{ProbeResult, RuntimeProbe, StrategyKind};
pub use transport::{ModelConverter, Transport};
