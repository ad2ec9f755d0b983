//! Streaming downloads into the blob store.
//!
//! Two entry points: [`fetch_to_blob`] hashes while streaming and commits in
//! one pass; [`fetch_resumable`] appends to a stable staging file with HTTP
//! Range so an interrupted transfer of a large model picks up where it left
//! off. Both leave only `tmp/` state behind on failure.

use crate::config::NetworkTuning;
use crate::error::{Result, StoreError};
use crate::network::client::HttpClient;
use crate::store::blob::{Blob, BlobStore};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::StatusCode;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Progress snapshot handed to callbacks.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| (self.bytes_downloaded as f64 / t as f64) * 100.0)
    }
}

/// Callback invoked at most every [`NetworkTuning::DOWNLOAD_PROGRESS_INTERVAL`].
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Throttles progress emission to the configured interval.
struct ProgressGate {
    callback: Option<ProgressCallback>,
    last: Mutex<Instant>,
}

impl ProgressGate {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            last: Mutex::new(Instant::now()),
        }
    }

    fn report(&self, bytes_downloaded: u64, total_bytes: Option<u64>, force: bool) {
        let Some(ref callback) = self.callback else {
            return;
        };
        let mut last = self.last.lock().expect("progress gate poisoned");
        if force || last.elapsed() >= NetworkTuning::DOWNLOAD_PROGRESS_INTERVAL {
            callback(DownloadProgress {
                bytes_downloaded,
                total_bytes,
            });
            *last = Instant::now();
        }
    }
}

/// Stream `url` straight into the blob store, hashing on the way.
pub async fn fetch_to_blob(
    client: &HttpClient,
    blobs: &BlobStore,
    url: &str,
    headers: Option<HeaderMap>,
    bearer: Option<&str>,
    expected: Option<&str>,
    progress: Option<ProgressCallback>,
) -> Result<Blob> {
    let response = client.get(url, headers, bearer).await?;
    let total_bytes = response.content_length();
    debug!("Downloading {url} ({total_bytes:?} bytes)");

    let gate = Arc::new(ProgressGate::new(progress));
    let gate_in = gate.clone();
    let mut bytes_downloaded: u64 = 0;

    let stream = response.bytes_stream().map(move |chunk| {
        let chunk = chunk.map_err(StoreError::from)?;
        bytes_downloaded += chunk.len() as u64;
        gate_in.report(bytes_downloaded, total_bytes, false);
        Ok(chunk)
    });
    tokio::pin!(stream);

    let blob = blobs.put_stream(stream, expected).await?;
    gate.report(blob.size, total_bytes, true);
    info!("Downloaded {url} -> blob {}", blob.digest);
    Ok(blob)
}

/// Download with resume support.
///
/// Bytes accumulate in a stable staging file keyed by `resume_key`
/// (normally the expected digest); on retry an HTTP Range request continues
/// from the staged length. The completed file is re-hashed and committed.
pub async fn fetch_resumable(
    client: &HttpClient,
    blobs: &BlobStore,
    url: &str,
    mut headers: HeaderMap,
    bearer: Option<&str>,
    resume_key: &str,
    expected: Option<&str>,
    progress: Option<ProgressCallback>,
) -> Result<Blob> {
    let partial = blobs.partial_path(resume_key);
    if let Some(parent) = partial.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::io_with_path(e, parent.to_path_buf()))?;
    }

    let staged_len = std::fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);
    if staged_len > 0 {
        debug!("Resuming {url} from byte {staged_len}");
        headers.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={staged_len}-"))
                .expect("range header is ASCII"),
        );
    }

    let response = client.get(url, Some(headers), bearer).await?;
    let status = response.status();

    // 206 continues the staged bytes; a plain 200 means the server ignored
    // the range, so the transfer restarts from scratch.
    let (mut file, mut bytes_downloaded) = if status == StatusCode::PARTIAL_CONTENT && staged_len > 0
    {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(&partial)
            .map_err(|e| StoreError::io_with_path(e, partial.clone()))?;
        (file, staged_len)
    } else {
        let file = std::fs::File::create(&partial)
            .map_err(|e| StoreError::io_with_path(e, partial.clone()))?;
        (file, 0)
    };

    let total_bytes = response
        .content_length()
        .map(|len| len + if status == StatusCode::PARTIAL_CONTENT { staged_len } else { 0 });

    let gate = ProgressGate::new(progress);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StoreError::from)?;
        file.write_all(&chunk)
            .map_err(|e| StoreError::io_with_path(e, partial.clone()))?;
        bytes_downloaded += chunk.len() as u64;
        gate.report(bytes_downloaded, total_bytes, false);
    }
    file.flush()
        .map_err(|e| StoreError::io_with_path(e, partial.clone()))?;
    drop(file);

    gate.report(bytes_downloaded, total_bytes, true);
    blobs.commit_partial(&partial, expected)
}
