//! File-backed cache store: one JSON file per key plus a background sweep

use crate::cache::config::{CacheSettings, RestartExpiry};
use crate::cache::entry::{add_std, Cacheable, EntryOptions};
use crate::cache::json::JsonCodec;
use crate::cache::key::{KeyCodec, CACHE_FILE_EXTENSION};
use crate::cache::types::{CacheStats, StatsCounters};
use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Expiration bookkeeping for one cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIndexEntry {
    pub created_at: DateTime<Utc>,
    pub absolute_expiration: DateTime<Utc>,
    pub cache_item_path: PathBuf,
}

impl FileIndexEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.absolute_expiration <= now
    }
}

/// Durable key/value cache backed by a directory of `*.cache` files.
///
/// This implementation provides:
/// - One file per key, raw JSON, no envelope
/// - Reads and writes ordered through a single async gate
/// - An expiration index kept independently of the files themselves
/// - A supervised sweep task that deletes expired files
///
/// The directory is assumed to belong to a single store instance.
pub struct FileCacheStore {
    inner: Arc<FileCacheInner>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct FileCacheInner {
    enabled: bool,
    directory: PathBuf,
    default_expiration: Duration,
    index: DashMap<PathBuf, FileIndexEntry>,
    gate: Mutex<()>,
    codec: Arc<JsonCodec>,
    stats: StatsCounters,
}

impl FileCacheStore {
    /// Open the store described by `settings`.
    ///
    /// Fails only on configuration problems. When caching is enabled the
    /// directory is created, existing files are indexed and the sweep task
    /// is started.
    pub async fn new(settings: &CacheSettings, codec: Arc<JsonCodec>) -> Result<Self> {
        settings.validate()?;
        let directory = settings.file.resolve_directory()?;

        let inner = Arc::new(FileCacheInner {
            enabled: settings.enabled,
            directory,
            default_expiration: settings.file.default_expiration,
            index: DashMap::new(),
            gate: Mutex::new(()),
            codec,
            stats: StatsCounters::default(),
        });

        let shutdown = CancellationToken::new();
        let store = Self {
            inner: Arc::clone(&inner),
            shutdown: shutdown.clone(),
            sweeper: Mutex::new(None),
        };

        if !inner.enabled {
            info!("File cache disabled; {:?} left untouched", inner.directory);
            return Ok(store);
        }

        tokio::fs::create_dir_all(&inner.directory).await?;
        let seeded = inner.seed_index(settings.file.restart_expiry).await;
        info!(
            "File cache ready at {:?} ({} existing entries, sweep every {:?})",
            inner.directory, seeded, settings.file.sweep_interval
        );

        let handle = tokio::spawn(run_sweeper(
            inner,
            settings.file.sweep_interval,
            shutdown,
        ));
        *store.sweeper.lock().await = Some(handle);

        Ok(store)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Directory holding the cache files
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Path the given key is stored at
    pub fn path_for(&self, key: &str) -> PathBuf {
        KeyCodec::file_path(&self.inner.directory, key)
    }

    /// Read and decode the value stored for `key`.
    ///
    /// Missing, empty or undecodable files are all misses. A file that still
    /// fails to decode after the sanitization pass is deleted.
    pub async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T> {
        if !self.inner.enabled {
            return None;
        }
        if key.trim().is_empty() {
            warn!("File cache lookup with an empty key");
            return None;
        }

        let path = self.path_for(key);
        let _guard = self.inner.gate.lock().await;

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.inner.stats.miss();
                return None;
            }
            Err(e) => {
                warn!("Failed to read cache file {:?}: {}", path, e);
                self.inner.stats.miss();
                return None;
            }
        };

        if text.trim().is_empty() {
            debug!("Cache file {:?} is empty", path);
            self.inner.stats.miss();
            return None;
        }

        match self.inner.codec.from_str_lenient::<T>(&text) {
            Ok(value) => {
                debug!("File cache hit: {}", key);
                self.inner.stats.hit();
                Some(value)
            }
            Err(e) => {
                warn!("Discarding corrupt cache file {:?}: {}", path, e);
                self.inner.stats.corrupt();
                self.inner.stats.miss();
                self.inner.delete_file(&path).await;
                None
            }
        }
    }

    /// Write `value` for `key`, replacing any previous file.
    ///
    /// Without an expiration in `options` the entry lives for the configured
    /// default. Failures are logged and swallowed.
    pub async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions) {
        if !self.inner.enabled {
            return;
        }
        if key.trim().is_empty() {
            warn!("Ignoring file cache write with an empty key");
            return;
        }

        let text = match self.inner.codec.to_string(value) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "null" {
            warn!("Ignoring file cache write of a null value for {}", key);
            return;
        }

        let path = self.path_for(key);
        let now = Utc::now();
        let absolute_expiration = options
            .effective_deadline(now)
            .unwrap_or_else(|| add_std(now, self.inner.default_expiration));

        let _guard = self.inner.gate.lock().await;
        if let Err(e) = tokio::fs::write(&path, text.as_bytes()).await {
            error!("Failed to write cache file {:?}: {}", path, e);
            return;
        }

        self.inner.index.insert(
            path.clone(),
            FileIndexEntry {
                created_at: now,
                absolute_expiration,
                cache_item_path: path,
            },
        );
        self.inner.stats.write();
        debug!("File cache write: {} (expires {})", key, absolute_expiration);
    }

    /// Delete the file for `key`; removing a missing key is a no-op
    pub async fn remove(&self, key: &str) {
        if !self.inner.enabled || key.trim().is_empty() {
            return;
        }

        let path = self.path_for(key);
        let _guard = self.inner.gate.lock().await;
        if self.inner.delete_file(&path).await {
            self.inner.stats.removal();
        }
    }

    /// Delete every file whose recorded expiration has passed.
    ///
    /// Runs on the sweep cadence; callable directly as well.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired().await
    }

    /// Expiration record for `key`, if tracked
    pub fn index_entry(&self, key: &str) -> Option<FileIndexEntry> {
        self.inner
            .index
            .get(&self.path_for(key))
            .map(|e| e.value().clone())
    }

    /// All tracked entries, ordered by path
    pub fn list_entries(&self) -> Vec<FileIndexEntry> {
        let mut entries: Vec<FileIndexEntry> = self
            .inner
            .index
            .iter()
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.cache_item_path.cmp(&b.cache_item_path));
        entries
    }

    /// Number of tracked entries
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.inner.index.len() as u64)
    }

    /// Stop the sweep task and wait for it to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("File cache sweeper ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for FileCacheStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl FileCacheInner {
    /// Index the `*.cache` files already present in the directory
    async fn seed_index(&self, policy: RestartExpiry) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to scan cache directory {:?}: {}", self.directory, e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut seeded = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to scan cache directory {:?}: {}", self.directory, e);
                    break;
                }
            };

            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != CACHE_FILE_EXTENSION) {
                continue;
            }

            let created_at = match policy {
                RestartExpiry::FromScanTime => now,
                RestartExpiry::FromModifiedTime => entry
                    .metadata()
                    .await
                    .ok()
                    .filter(|m| m.is_file())
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(now),
            };

            self.index.insert(
                path.clone(),
                FileIndexEntry {
                    created_at,
                    absolute_expiration: add_std(created_at, self.default_expiration),
                    cache_item_path: path,
                },
            );
            seeded += 1;
        }

        seeded
    }

    /// Delete the file and its index entry; true when either existed
    async fn delete_file(&self, path: &Path) -> bool {
        let deleted = match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Deleted cache file {:?}", path);
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Failed to delete cache file {:?}: {}", path, e);
                false
            }
        };
        self.index.remove(path).is_some() || deleted
    }

    async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let candidates = self.expired_paths(now);
        self.remove_expired(candidates, now).await
    }

    fn expired_paths(&self, now: DateTime<Utc>) -> Vec<PathBuf> {
        self.index
            .iter()
            .filter(|e| e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Delete the candidates that are still expired once the gate is held;
    /// an entry rewritten since the candidates were collected is kept
    async fn remove_expired(&self, candidates: Vec<PathBuf>, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for path in candidates {
            let _guard = self.gate.lock().await;
            let still_expired = self
                .index
                .get(&path)
                .map_or(false, |e| e.value().is_expired_at(now));
            if !still_expired {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    // Keep the index entry so the next pass retries
                    error!("Failed to delete expired cache file {:?}: {}", path, e);
                    continue;
                }
            }
            self.index.remove(&path);
            removed += 1;
        }

        if removed > 0 {
            self.stats.expired(removed as u64);
            debug!("Swept {} expired cache files", removed);
        }
        removed
    }
}

/// Background task deleting expired files until cancelled
async fn run_sweeper(inner: Arc<FileCacheInner>, interval: Duration, shutdown: CancellationToken) {
    info!("Starting file cache sweep task (interval: {:?})", interval);

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.sweep_expired().await;
            }
        }
    }

    debug!("File cache sweep task stopped");
}
