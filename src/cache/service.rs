//! Tier-independent cache contract and deployment-time tier selection

use crate::cache::config::CacheSettings;
use crate::cache::entry::{Cacheable, EntryOptions};
use crate::cache::file::FileCacheStore;
use crate::cache::json::JsonCodec;
use crate::cache::memory::MemoryCacheStore;
use crate::cache::types::{CacheStats, CacheTier};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// The three operations callers depend on.
///
/// Implementations never surface storage failures: a failed read is a miss
/// and a failed write or removal is logged and dropped.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Fetch the value stored for `key`, if any
    async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T>;

    /// Store `value` for `key`
    async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions);

    /// Forget `key`
    async fn remove(&self, key: &str);
}

#[async_trait]
impl CacheService for FileCacheStore {
    async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T> {
        FileCacheStore::try_get(self, key).await
    }

    async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions) {
        FileCacheStore::create_entry(self, key, value, options).await
    }

    async fn remove(&self, key: &str) {
        FileCacheStore::remove(self, key).await
    }
}

#[async_trait]
impl CacheService for MemoryCacheStore {
    async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T> {
        MemoryCacheStore::try_get(self, key).await
    }

    async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions) {
        MemoryCacheStore::create_entry(self, key, value, options).await
    }

    async fn remove(&self, key: &str) {
        MemoryCacheStore::remove(self, key).await
    }
}

/// The store selected by configuration
pub enum CacheBackend {
    Memory(MemoryCacheStore),
    File(FileCacheStore),

    /// Caching switched off: every read misses, every write is dropped
    Disabled,
}

impl CacheBackend {
    /// Build the tier named by `settings.tier`
    pub async fn from_settings(settings: &CacheSettings, codec: Arc<JsonCodec>) -> Result<Self> {
        settings.validate()?;
        if !settings.enabled {
            info!("Caching disabled");
            return Ok(CacheBackend::Disabled);
        }

        let backend = match settings.tier {
            CacheTier::Memory => CacheBackend::Memory(MemoryCacheStore::new(settings, codec).await?),
            CacheTier::File => CacheBackend::File(FileCacheStore::new(settings, codec).await?),
        };
        info!("Cache backend: {}", settings.tier);
        Ok(backend)
    }

    /// Tier in use, `None` when disabled
    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            CacheBackend::Memory(_) => Some(CacheTier::Memory),
            CacheBackend::File(_) => Some(CacheTier::File),
            CacheBackend::Disabled => None,
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self {
            CacheBackend::Memory(store) => store.stats(),
            CacheBackend::File(store) => store.stats(),
            CacheBackend::Disabled => CacheStats::default(),
        }
    }

    /// Stop background tasks; the memory tier also flushes its snapshot
    pub async fn shutdown(&self) {
        match self {
            CacheBackend::Memory(store) => store.shutdown().await,
            CacheBackend::File(store) => store.shutdown().await,
            CacheBackend::Disabled => {}
        }
    }
}

#[async_trait]
impl CacheService for CacheBackend {
    async fn try_get<T: Cacheable>(&self, key: &str) -> Option<T> {
        match self {
            CacheBackend::Memory(store) => store.try_get(key).await,
            CacheBackend::File(store) => store.try_get(key).await,
            CacheBackend::Disabled => None,
        }
    }

    async fn create_entry<T: Cacheable>(&self, key: &str, value: &T, options: EntryOptions) {
        match self {
            CacheBackend::Memory(store) => store.create_entry(key, value, options).await,
            CacheBackend::File(store) => store.create_entry(key, value, options).await,
            CacheBackend::Disabled => {}
        }
    }

    async fn remove(&self, key: &str) {
        match self {
            CacheBackend::Memory(store) => store.remove(key).await,
            CacheBackend::File(store) => store.remove(key).await,
            CacheBackend::Disabled => {}
        }
    }
}
