//! In-memory hot tier backed by moka, optionally warmed from a blob snapshot

use crate::cache::config::CacheSettings;
use crate::cache::entry::{CacheEntryRecord, CachePriority, Cacheable, EntryOptions};
use crate::cache::json::JsonCodec;
use crate::cache::types::{CacheKey, CacheStats, StatsCounters};
use crate::cache::warm::{FlushOutcome, WarmCacheLoader, WarmCacheSnapshot};
use crate::error::Result;
use chrono::Utc;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Value held by the hot-tier engine
#[derive(Clone)]
struct HotEntry {
    record: Arc<CacheEntryRecord>,

    /// Typed value as written; absent for entries restored from a snapshot
    value: Option<Arc<dyn Any + Send + Sync>>,

    deadline: Option<Instant>,
    sliding: Option<Duration>,
}

impl HotEntry {
    fn new(record: CacheEntryRecord, value: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        let now_utc = Utc::now();
        let now = Instant::now();

        // A deadline beyond what Instant can represent is treated as none
        let deadline = record.deadline().and_then(|d| {
            let remaining = (d - now_utc).to_std().unwrap_or(Duration::ZERO);
            now.checked_add(remaining)
        });

        Self {
            sliding: record.options.sliding_expiration,
            record: Arc::new(record),
            value,
            deadline,
        }
    }

    fn weight(&self) -> u32 {
        // Zero-weight entries are never chosen for size-based eviction
        if self.record.options.priority == CachePriority::NeverRemove {
            return 0;
        }
        self.record.calculate_size().clamp(1, u32::MAX as u64) as u32
    }

    /// Time left from `now`: the earlier of the absolute deadline and the sliding window
    fn time_to_live(&self, now: Instant) -> Option<Duration> {
        let remaining = self.deadline.map(|d| d.saturating_duration_since(now));
        match (remaining, self.sliding) {
            (Some(r), Some(s)) => Some(r.min(s)),
            (r, s) => r.or(s),
        }
    }
}

struct EntryExpiry;

impl Expiry<CacheKey, HotEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &HotEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        value.time_to_live(created_at)
    }

    fn expire_after_read(
        &self,
        _key: &CacheKey,
        value: &HotEntry,
        read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if value.sliding.is_some() {
            value.time_to_live(read_at)
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &HotEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.time_to_live(updated_at)
    }
}

/// Low-latency hot tier.
///
/// Entries expire at the earliest of their absolute deadline and sliding
/// window; the engine evicts by weight once `max_capacity` is reached. When a
/// [`WarmCacheLoader`] is attached, the store is populated from the snapshot
/// at construction and a supervised task flushes it back periodically.
pub struct MemoryCacheStore {
    inner: Arc<MemoryInner>,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct MemoryInner {
    enabled: bool,
    cache: Cache<CacheKey, HotEntry>,
    codec: Arc<JsonCodec>,
    loader: Option<Arc<WarmCacheLoader>>,
    stats: Arc<StatsCounters>,
}

impl MemoryCacheStore {
    /// Open the hot tier, building a warm loader from the blob settings when
    /// `use_warm_loader` is set
    pub async fn new(settings: &CacheSettings, codec: Arc<JsonCodec>) -> Result<Self> {
        settings.validate()?;
        let loader = if settings.enabled && settings.memory.use_warm_loader {
            Some(Arc::new(WarmCacheLoader::from_settings(
                &settings.blob,
                Arc::clone(&codec),
            )?))
        } else {
            None
        };
        Self::with_loader(settings, codec, loader).await
    }

    /// Open the hot tier with an explicit warm loader.
    ///
    /// The snapshot is loaded before this returns; a failed load is logged and
    /// the store starts empty.
    pub async fn with_loader(
        settings: &CacheSettings,
        codec: Arc<JsonCodec>,
        loader: Option<Arc<WarmCacheLoader>>,
    ) -> Result<Self> {
        settings.validate()?;

        let stats = Arc::new(StatsCounters::default());
        let listener_stats = Arc::clone(&stats);
        let cache = Cache::builder()
            .max_capacity(settings.memory.max_capacity)
            .weigher(|_key: &CacheKey, entry: &HotEntry| entry.weight())
            .expire_after(EntryExpiry)
            .eviction_listener(move |key, _entry, cause| {
                if cause == RemovalCause::Expired {
                    debug!("Hot cache entry expired: {}", key);
                    listener_stats.expired(1);
                }
            })
            .build();

        let inner = Arc::new(MemoryInner {
            enabled: settings.enabled,
            cache,
            codec,
            loader: if settings.enabled { loader } else { None },
            stats,
        });

        let shutdown = CancellationToken::new();
        let store = Self {
            inner: Arc::clone(&inner),
            shutdown: shutdown.clone(),
            flusher: Mutex::new(None),
        };

        if !inner.enabled {
            info!("Memory cache disabled");
            return Ok(store);
        }

        let Some(loader) = inner.loader.clone() else {
            info!(
                "Memory cache ready (capacity {} bytes, no warm snapshot)",
                settings.memory.max_capacity
            );
            return Ok(store);
        };

        let restored = inner.restore(&loader).await;
        let interval = settings.memory.flush_interval_with_jitter();
        info!(
            "Memory cache ready ({} entries restored from {}, flush every {:?})",
            restored,
            loader.blob_name(),
            interval
        );

        let handle = tokio::spawn(run_flusher(
            inner,
            settings.memory.flush_initial_delay,
            interval,
            shutdown,
        ));
        *store.flusher.lock().await = Some(handle);

        Ok(store)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// The attached warm loader, if any
    pub fn loader(&self) -> Option<&Arc<WarmCacheLoader>> {
        self.inner.loader.as_ref()
    }

    /// Look up `key` as a `T`; a kind mismatch is a miss
    pub async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T> {
        if !self.inner.enabled {
            return None;
        }
        if key.trim().is_empty() {
            warn!("Memory cache lookup with an empty key");
            return None;
        }

        let Some(entry) = self.inner.cache.get(key).await else {
            self.inner.stats.miss();
            return None;
        };

        if let Some(value) = entry.value.clone().and_then(|v| v.downcast::<T>().ok()) {
            self.inner.stats.hit();
            return Some(T::clone(&value));
        }

        match entry.record.decode::<T>() {
            Ok(value) => {
                debug!("Memory cache hit (decoded): {}", key);
                self.inner.stats.hit();
                Some(value)
            }
            Err(e) => {
                debug!("Memory cache entry {} not readable as requested type: {}", key, e);
                self.inner.stats.miss();
                None
            }
        }
    }

    /// Store `value` for `key` and mirror the write to the warm loader.
    ///
    /// Only the expirations given in `options` apply; there is no default.
    pub async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions) {
        if !self.inner.enabled {
            return;
        }
        if key.trim().is_empty() {
            warn!("Ignoring memory cache write with an empty key");
            return;
        }

        let record = match CacheEntryRecord::from_value(key, value, options, &self.inner.codec) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring memory cache write for {}: {}", key, e);
                return;
            }
        };

        let typed: Arc<dyn Any + Send + Sync> = Arc::new(value.clone());
        let entry = HotEntry::new(record, Some(typed));
        let record = Arc::clone(&entry.record);
        self.inner.cache.insert(key.to_string(), entry).await;

        // Marked only once the value is visible, so a flush that clears the
        // mark always snapshots it
        if let Some(loader) = &self.inner.loader {
            loader.record_write(&record);
        }
        self.inner.stats.write();
        debug!("Memory cache write: {}", key);
    }

    /// Evict `key` from the hot tier; the remote snapshot drops it on the next flush
    pub async fn remove(&self, key: &str) {
        if !self.inner.enabled || key.trim().is_empty() {
            return;
        }

        let removed = self.inner.cache.remove(key).await;
        if let Some(loader) = &self.inner.loader {
            loader.record_removal(key);
        }
        if removed.is_some() {
            self.inner.stats.removal();
        }
    }

    /// Current hot-tier content as a snapshot
    pub fn snapshot(&self) -> WarmCacheSnapshot {
        self.inner.snapshot()
    }

    /// Flush to the warm snapshot if anything changed since the last flush
    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.inner.flush_if_dirty().await
    }

    /// Number of live entries, after pending engine maintenance has run
    pub async fn len(&self) -> u64 {
        self.inner.cache.run_pending_tasks().await;
        self.inner.cache.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.inner.cache.entry_count())
    }

    /// Stop the flush task and push one final snapshot
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.flusher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Warm cache flush task ended abnormally: {}", e);
            }
        }

        if self.inner.loader.is_some() {
            if let Err(e) = self.inner.flush_if_dirty().await {
                error!("Final warm cache flush failed: {}", e);
            }
        }
    }
}

impl Drop for MemoryCacheStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MemoryInner {
    /// Populate the engine from the warm snapshot; returns the restored count
    async fn restore(&self, loader: &WarmCacheLoader) -> usize {
        let decoded = match loader.load().await {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Failed to load warm cache snapshot {}: {}", loader.blob_name(), e);
                return 0;
            }
        };

        let mut restored = 0;
        for (key, record) in decoded.snapshot.entries {
            self.cache.insert(key, HotEntry::new(record, None)).await;
            restored += 1;
        }
        restored
    }

    fn snapshot(&self) -> WarmCacheSnapshot {
        let now = Utc::now();
        let mut snapshot = WarmCacheSnapshot::new();
        for (_key, entry) in self.cache.iter() {
            if !entry.record.is_expired_at(now) {
                snapshot.insert(CacheEntryRecord::clone(&entry.record));
            }
        }
        snapshot
    }

    async fn flush_if_dirty(&self) -> Result<FlushOutcome> {
        let Some(loader) = &self.loader else {
            return Ok(FlushOutcome::Skipped);
        };
        let outcome = loader.flush_if_dirty(|| self.snapshot()).await?;
        if let FlushOutcome::Uploaded { adopted, .. } = &outcome {
            self.adopt(adopted).await;
        }
        Ok(outcome)
    }

    /// Take in records another writer added to the remote snapshot, without
    /// replacing anything written here since
    async fn adopt(&self, records: &[CacheEntryRecord]) {
        for record in records {
            let entry = HotEntry::new(record.clone(), None);
            self.cache.entry(record.key.clone()).or_insert(entry).await;
        }
        if !records.is_empty() {
            debug!("Adopted {} entries from the remote warm snapshot", records.len());
        }
    }
}

/// Background task flushing the hot tier to the warm snapshot until cancelled
async fn run_flusher(
    inner: Arc<MemoryInner>,
    initial_delay: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "Starting warm cache flush task (delay: {:?}, interval: {:?})",
        initial_delay, interval
    );

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match inner.flush_if_dirty().await {
                    Ok(FlushOutcome::Uploaded { entries, .. }) => {
                        debug!("Periodic warm cache flush wrote {} entries", entries)
                    }
                    Ok(FlushOutcome::Skipped) => {}
                    Err(e) => error!("Periodic warm cache flush failed: {}", e),
                }
            }
        }
    }

    debug!("Warm cache flush task stopped");
}
