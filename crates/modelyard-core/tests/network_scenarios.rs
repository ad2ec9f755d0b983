//! Live-registry scenarios. These hit real registries and download real
//! models, so they are ignored by default; run them explicitly with
//! `cargo test -- --ignored` on a machine with network access.

use modelyard_core::{ModelStore, StoreConfig, TransportKind};
use tempfile::TempDir;

#[tokio::test]
#[ignore = "requires network access and downloads ~600MB"]
async fn pull_tinyllama_from_ollama_hub() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("store");
    let store = ModelStore::new(StoreConfig::new(&root)).unwrap();

    let ref_file = store.pull("ollama://tinyllama").await.unwrap();
    assert_eq!(ref_file.identifier.transport, TransportKind::Ollama);
    assert!(!ref_file.blobs.is_empty());

    // Stable on-disk layout.
    assert!(root.join("refs/hub/library/tinyllama/latest.json").is_file());

    // Snapshot entry resolves to a real blob path.
    let snapshot_entry = root.join("snapshots/hub/library/tinyllama/latest/model.file");
    let resolved = std::fs::canonicalize(&snapshot_entry).unwrap();
    assert!(resolved.starts_with(root.join("blobs")));
    assert!(resolved.is_file());

    // Second pull changes nothing.
    let entry = store.list_entry("ollama://tinyllama").await.unwrap();
    assert!(entry.is_file());
    store.pull("ollama://tinyllama").await.unwrap();
}

#[tokio::test]
#[ignore = "requires network access"]
async fn pull_gguf_from_huggingface() {
    let tmp = TempDir::new().unwrap();
    let store = ModelStore::new(StoreConfig::new(tmp.path().join("store"))).unwrap();

    let ref_file = store
        .pull("hf://TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF:Q2_K")
        .await
        .unwrap();
    assert!(ref_file.verified);
    assert!(ref_file
        .blobs
        .iter()
        .any(|b| b.logical_path.ends_with(".gguf")));
}

#[tokio::test]
#[ignore = "requires a writable local registry at localhost:5000"]
async fn push_local_file_to_registry_and_pull_back() {
    let tmp = TempDir::new().unwrap();
    let store = ModelStore::new(StoreConfig::new(tmp.path().join("store"))).unwrap();

    // A crafted GGUF as the local source.
    let mut gguf = Vec::new();
    gguf.extend_from_slice(b"GGUF");
    gguf.extend_from_slice(&3u32.to_le_bytes());
    gguf.extend_from_slice(&0u64.to_le_bytes());
    gguf.extend_from_slice(&0u64.to_le_bytes());
    let source = tmp.path().join("m.gguf");
    std::fs::write(&source, &gguf).unwrap();
    let source_digest = modelyard_core::digest::hash_file(&source).unwrap();

    let model = format!("file://{}", source.display());
    let target = "oci://localhost:5000/test/m:latest";
    store.push(&model, target).await.unwrap();

    // Pulling the pushed artifact back yields a blob with the identical
    // digest as the original file.
    let pulled = store.pull(target).await.unwrap();
    assert!(pulled
        .blobs
        .iter()
        .any(|b| b.digest_hex() == source_digest));
}
