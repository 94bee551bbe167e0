//! Integration tests for the file tier
//!
//! These tests exercise the store through its public API against a real
//! temporary directory:
//! - Round-trips and misses
//! - Key sanitization
//! - Corruption handling
//! - Background sweep and restart behaviour

use faultline_core::cache::{
    CacheSettings, CacheTier, Cacheable, EntryOptions, FileCacheStore, JsonCodec, KeyCodec,
    PayloadKind, RestartExpiry,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
}

impl Cacheable for User {
    const KIND: PayloadKind = PayloadKind::Structured;
}

fn settings(dir: &Path) -> CacheSettings {
    CacheSettings::builder()
        .tier(CacheTier::File)
        .directory(dir)
        .build()
}

async fn open_with(settings: &CacheSettings) -> FileCacheStore {
    FileCacheStore::new(settings, Arc::new(JsonCodec::default()))
        .await
        .unwrap()
}

fn cache_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_round_trip_of_several_kinds() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    let user = User {
        name: "Ada".to_string(),
    };
    store.create_entry("user", &user, EntryOptions::new()).await;
    store
        .create_entry("embedding", &vec![0.25f32, -1.5, 3.0], EntryOptions::new())
        .await;
    store
        .create_entry("reply", &"the disk is full".to_string(), EntryOptions::new())
        .await;

    assert_eq!(store.try_get::<User>("user").await, Some(user));
    assert_eq!(
        store.try_get::<Vec<f32>>("embedding").await,
        Some(vec![0.25, -1.5, 3.0])
    );
    assert_eq!(
        store.try_get::<String>("reply").await,
        Some("the disk is full".to_string())
    );

    // Files hold the raw JSON value, no envelope
    let raw = std::fs::read_to_string(tmp.path().join("user.cache")).unwrap();
    assert_eq!(raw, r#"{"name":"Ada"}"#);
}

#[tokio::test]
async fn test_missing_key_is_a_miss() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    assert_eq!(store.try_get::<String>("never-written").await, None);
    assert_eq!(store.try_get::<String>("").await, None);
    assert_eq!(store.stats().misses, 1);
}

#[tokio::test]
async fn test_double_remove_is_harmless() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    store
        .create_entry("k", &"v".to_string(), EntryOptions::new())
        .await;
    store.remove("k").await;
    store.remove("k").await;
    store.remove("never-written").await;

    assert_eq!(store.try_get::<String>("k").await, None);
    assert!(store.is_empty());
    assert_eq!(store.stats().removals, 1);
}

#[tokio::test]
async fn test_null_write_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    store
        .create_entry("nothing", &serde_json::Value::Null, EntryOptions::new())
        .await;

    assert!(!store.path_for("nothing").exists());
    assert!(cache_files(tmp.path()).is_empty());
    assert_eq!(store.try_get::<serde_json::Value>("nothing").await, None);
    assert!(store.index_entry("nothing").is_none());
    assert_eq!(store.stats().writes, 0);
}

#[tokio::test]
async fn test_corrupt_file_is_deleted_on_read() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    store
        .create_entry("broken", &User { name: "x".to_string() }, EntryOptions::new())
        .await;
    let path = store.path_for("broken");
    std::fs::write(&path, "{\"name\": \"Ada\" oops ]]").unwrap();

    assert_eq!(store.try_get::<User>("broken").await, None);
    assert!(!path.exists());
    assert!(store.index_entry("broken").is_none());
    assert_eq!(store.stats().corrupt_entries, 1);
}

#[tokio::test]
async fn test_trailing_comma_is_repaired_not_deleted() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    let path = store.path_for("edited");
    std::fs::write(&path, "{\r\n  \"name\": \"Ada\",\r\n}").unwrap();

    assert_eq!(
        store.try_get::<User>("edited").await,
        Some(User {
            name: "Ada".to_string()
        })
    );
    assert!(path.exists());
}

#[tokio::test]
async fn test_background_sweep_removes_expired_entry() {
    let tmp = TempDir::new().unwrap();
    let settings = CacheSettings::builder()
        .tier(CacheTier::File)
        .directory(tmp.path())
        .sweep_interval(Duration::from_millis(100))
        .build();
    let store = open_with(&settings).await;

    store
        .create_entry(
            "stale",
            &"v".to_string(),
            EntryOptions::new().expires_at(chrono::Utc::now() - chrono::Duration::seconds(1)),
        )
        .await;
    store
        .create_entry("fresh", &"v".to_string(), EntryOptions::new())
        .await;
    assert!(store.path_for("stale").exists());

    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(!store.path_for("stale").exists());
    assert!(store.path_for("fresh").exists());
    assert_eq!(store.stats().evictions_ttl, 1);
    store.shutdown().await;
}

#[tokio::test]
async fn test_expired_but_unswept_file_is_still_read() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    store
        .create_entry(
            "late",
            &"v".to_string(),
            EntryOptions::new().expires_at(chrono::Utc::now() - chrono::Duration::seconds(1)),
        )
        .await;

    // Expiration is enforced by the sweep, not by reads
    assert_eq!(store.try_get::<String>("late").await, Some("v".to_string()));
}

#[tokio::test]
async fn test_disabled_store_performs_no_io() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("cache");
    let settings = CacheSettings::builder()
        .enabled(false)
        .tier(CacheTier::File)
        .directory(&dir)
        .build();
    let store = open_with(&settings).await;

    store
        .create_entry("k", &"v".to_string(), EntryOptions::new())
        .await;
    assert_eq!(store.try_get::<String>("k").await, None);
    assert!(!dir.exists());
    assert!(cache_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_sanitized_key_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    let key = "query?tenant=7|fault*";
    let first = store.path_for(key);
    for _ in 0..10 {
        assert_eq!(store.path_for(key), first);
    }
    assert_eq!(first, KeyCodec::file_path(tmp.path(), key));
    assert_ne!(store.path_for("query?tenant=8|fault*"), first);
}

#[tokio::test]
async fn test_colon_key_is_stored_under_hashed_name() {
    let tmp = TempDir::new().unwrap();
    let store = open_with(&settings(tmp.path())).await;

    let user = User {
        name: "Ada".to_string(),
    };
    store.create_entry("user:42", &user, EntryOptions::new()).await;

    assert!(!tmp.path().join("user:42.cache").exists());

    let files = cache_files(tmp.path());
    assert_eq!(files.len(), 1);
    let stem = files[0].strip_suffix(".cache").unwrap();
    assert!(stem.len() <= 64);
    assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));

    assert_eq!(store.try_get::<User>("user:42").await, Some(user));
}

#[tokio::test]
async fn test_existing_files_are_indexed_on_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_with(&settings(tmp.path())).await;
        store
            .create_entry("kept", &"v".to_string(), EntryOptions::new())
            .await;
        store.shutdown().await;
    }
    std::fs::write(tmp.path().join("notes.txt"), "not a cache file").unwrap();

    let settings = CacheSettings::builder()
        .tier(CacheTier::File)
        .directory(tmp.path())
        .restart_expiry(RestartExpiry::FromScanTime)
        .build();
    let before = chrono::Utc::now();
    let store = open_with(&settings).await;

    assert_eq!(store.len(), 1);
    let entry = store.index_entry("kept").unwrap();
    assert!(entry.created_at >= before);
    assert!(entry.absolute_expiration >= before + chrono::Duration::hours(24));
    assert_eq!(store.try_get::<String>("kept").await, Some("v".to_string()));
}

#[tokio::test]
async fn test_restart_honours_file_age_by_default() {
    let tmp = TempDir::new().unwrap();
    let settings = CacheSettings::builder()
        .tier(CacheTier::File)
        .directory(tmp.path())
        .default_expiration(Duration::from_secs(3600))
        .build();

    {
        let store = open_with(&settings).await;
        store
            .create_entry("old", &"v".to_string(), EntryOptions::new())
            .await;
        store.shutdown().await;
    }
    let modified = std::fs::metadata(tmp.path().join("old.cache"))
        .unwrap()
        .modified()
        .unwrap();

    let store = open_with(&settings).await;
    let entry = store.index_entry("old").unwrap();
    assert_eq!(entry.created_at, chrono::DateTime::<chrono::Utc>::from(modified));
    assert_eq!(
        entry.absolute_expiration,
        entry.created_at + chrono::Duration::seconds(3600)
    );
}
