//! Integration tests for the hot tier with a warm blob snapshot

use faultline_core::blob::{BlobBackend, BlobObjectClient, FsBlobBackend, MemoryBlobBackend, GZIP_ENCODING};
use faultline_core::cache::{
    BlobBackendKind, BlobSettings, CacheSettings, EntryOptions, JsonCodec, MemoryCacheStore,
    WarmCacheLoader, WarmCacheSnapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SNAPSHOT: &str = "cache/warm-cache.json";

fn codec() -> Arc<JsonCodec> {
    Arc::new(JsonCodec::default())
}

fn loader_for(backend: Arc<dyn BlobBackend>) -> Arc<WarmCacheLoader> {
    Arc::new(WarmCacheLoader::new(
        BlobObjectClient::new(backend),
        SNAPSHOT,
        codec(),
    ))
}

#[tokio::test]
async fn test_snapshot_populates_store_without_further_remote_calls() {
    let backend = Arc::new(MemoryBlobBackend::new());
    BlobObjectClient::new(backend.clone())
        .put(SNAPSHOT, br#"{"a": "1"}"#, None)
        .await
        .unwrap();

    let store = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend.clone())),
    )
    .await
    .unwrap();
    let gets_after_load = backend.get_count();
    assert_eq!(gets_after_load, 1);

    assert_eq!(store.try_get::<String>("a").await, Some("1".to_string()));
    assert_eq!(store.try_get::<String>("a").await, Some("1".to_string()));
    assert_eq!(backend.get_count(), gets_after_load);
}

#[tokio::test]
async fn test_uncompressed_snapshot_is_accepted() {
    let backend = Arc::new(MemoryBlobBackend::new());
    backend
        .put(SNAPSHOT, br#"{"a": "1", "b": [1.0, 2.0]}"#.to_vec(), None, None)
        .await
        .unwrap();

    let store = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend)),
    )
    .await
    .unwrap();

    assert_eq!(store.try_get::<String>("a").await, Some("1".to_string()));
    assert_eq!(store.try_get::<Vec<f32>>("b").await, Some(vec![1.0, 2.0]));
}

#[tokio::test]
async fn test_bad_entries_do_not_abort_the_load() {
    let backend = Arc::new(MemoryBlobBackend::new());
    let body = serde_json::json!({
        "good": "fine",
        "bad": {"key": "bad", "serialized_value": "\"x\"", "kind": "embedding", "created_at": "2024-01-01T00:00:00Z"},
        "empty": null,
    });
    BlobObjectClient::new(backend.clone())
        .put(SNAPSHOT, body.to_string().as_bytes(), None)
        .await
        .unwrap();

    let loader = loader_for(backend.clone());
    let decoded = loader.load().await.unwrap();
    assert_eq!(decoded.snapshot.len(), 1);
    assert_eq!(decoded.skipped.len(), 2);

    let store = MemoryCacheStore::with_loader(&CacheSettings::default(), codec(), Some(loader))
        .await
        .unwrap();
    assert_eq!(store.try_get::<String>("good").await, Some("fine".to_string()));
    assert_eq!(store.try_get::<Vec<f32>>("bad").await, None);
}

#[tokio::test]
async fn test_unreadable_snapshot_starts_empty() {
    let backend = Arc::new(MemoryBlobBackend::new());
    backend
        .put(SNAPSHOT, b"not gzip at all".to_vec(), Some(GZIP_ENCODING), None)
        .await
        .unwrap();

    let store = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend)),
    )
    .await
    .unwrap();
    assert!(store.is_empty().await);

    store.create_entry("k", &"v".to_string(), EntryOptions::new()).await;
    assert_eq!(store.try_get::<String>("k").await, Some("v".to_string()));
}

#[tokio::test]
async fn test_shutdown_persists_and_restart_restores() {
    let tmp = TempDir::new().unwrap();
    let backend: Arc<dyn BlobBackend> = Arc::new(FsBlobBackend::new(tmp.path()));

    let store = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend.clone())),
    )
    .await
    .unwrap();
    store
        .create_entry("embedding:doc-1", &vec![0.5f32, 0.25], EntryOptions::new())
        .await;
    store
        .create_entry("reply:9", &"restart the pod".to_string(), EntryOptions::new())
        .await;
    store.create_entry("gone", &"x".to_string(), EntryOptions::new()).await;
    store.remove("gone").await;
    store.shutdown().await;

    // Snapshot on disk is gzip-compressed
    let raw = backend.get(SNAPSHOT).await.unwrap().unwrap();
    assert_eq!(raw.content_encoding.as_deref(), Some(GZIP_ENCODING));
    assert_eq!(&raw.bytes[..2], &[0x1f, 0x8b]);

    let restarted = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend)),
    )
    .await
    .unwrap();
    assert_eq!(
        restarted.try_get::<Vec<f32>>("embedding:doc-1").await,
        Some(vec![0.5, 0.25])
    );
    assert_eq!(
        restarted.try_get::<String>("reply:9").await,
        Some("restart the pod".to_string())
    );
    assert_eq!(restarted.try_get::<String>("gone").await, None);
}

#[tokio::test]
async fn test_expired_records_are_not_restored() {
    let backend = Arc::new(MemoryBlobBackend::new());
    let store = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend.clone())),
    )
    .await
    .unwrap();
    store
        .create_entry(
            "brief",
            &"v".to_string(),
            EntryOptions::new().expires_in(Duration::from_millis(200)),
        )
        .await;
    store.shutdown().await;

    let snapshot: WarmCacheSnapshot = serde_json::from_slice(
        &BlobObjectClient::new(backend.clone())
            .get(SNAPSHOT)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert!(snapshot.entries.contains_key("brief"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let restarted = MemoryCacheStore::with_loader(
        &CacheSettings::default(),
        codec(),
        Some(loader_for(backend)),
    )
    .await
    .unwrap();
    assert_eq!(restarted.try_get::<String>("brief").await, None);
}

#[tokio::test]
async fn test_store_builds_loader_from_settings() {
    let tmp = TempDir::new().unwrap();
    let settings = CacheSettings::builder()
        .use_warm_loader(true)
        .blob(BlobSettings {
            backend: BlobBackendKind::Filesystem,
            directory: Some(tmp.path().to_path_buf()),
            ..Default::default()
        })
        .build();

    let store = MemoryCacheStore::new(&settings, codec()).await.unwrap();
    assert_eq!(store.loader().unwrap().blob_name(), SNAPSHOT);

    store.create_entry("k", &"v".to_string(), EntryOptions::new()).await;
    store.shutdown().await;
    assert!(tmp.path().join("cache").join("warm-cache.json").exists());
}

#[tokio::test]
async fn test_warm_loader_requires_blob_location() {
    let settings = CacheSettings::builder()
        .use_warm_loader(true)
        .blob(BlobSettings {
            backend: BlobBackendKind::Azure,
            container_url: None,
            ..Default::default()
        })
        .build();

    assert!(MemoryCacheStore::new(&settings, codec()).await.is_err());
}
