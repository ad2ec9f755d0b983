//! HTTP plumbing shared by the transports: client wrapper, streaming
//! downloads into the blob store, and retry with backoff.

pub mod client;
pub mod download;
pub mod retry;

pub use client::HttpClient;
pub use download::{DownloadProgress, ProgressCallback};
pub use retry::{with_retry, RetryConfig};
