//! # Tiered Cache
//!
//! Caching core shared by the chat, embedding and fault-analysis services.
//!
//! ## Tiers
//!
//! - **Hot**: [`MemoryCacheStore`], in-process, weighted by entry size, with
//!   absolute and sliding expiration
//! - **Warm**: a gzip-compressed JSON snapshot of the hot tier in blob storage,
//!   loaded at startup and flushed back periodically by [`WarmCacheLoader`]
//! - **Cold**: [`FileCacheStore`], one JSON file per key, swept in the background
//!
//! Callers depend on [`CacheService`] only; which tier backs it is decided by
//! [`CacheSettings::tier`] when the [`CacheBackend`] is built.
//!
//! ## Example
//!
//! ```no_run
//! use faultline_core::cache::{CacheBackend, CacheService, CacheSettings, CacheTier, EntryOptions, JsonCodec};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = CacheSettings::builder()
//!     .tier(CacheTier::File)
//!     .directory("/var/cache/faultline")
//!     .build();
//!
//! let cache = CacheBackend::from_settings(&settings, Arc::new(JsonCodec::default())).await?;
//!
//! let options = EntryOptions::new().expires_in(Duration::from_secs(3600));
//! cache.create_entry("summary:42", &"disk pressure on node-7".to_string(), options).await;
//!
//! if let Some(summary) = cache.try_get::<String>("summary:42").await {
//!     println!("Cache hit: {}", summary);
//! }
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod file;
pub mod json;
pub mod key;
pub mod memory;
pub mod service;
pub mod types;
pub mod warm;

pub use config::{
    BlobBackendKind, BlobSettings, CacheSettings, CacheSettingsBuilder, FileCacheSettings,
    MemoryCacheSettings, RestartExpiry,
};
pub use entry::{CacheEntryRecord, CachePriority, Cacheable, EntryOptions, PayloadKind};
pub use file::{FileCacheStore, FileIndexEntry};
pub use json::{JsonCodec, JsonOptions};
pub use key::KeyCodec;
pub use memory::MemoryCacheStore;
pub use service::{CacheBackend, CacheService};
pub use types::{CacheKey, CacheStats, CacheTier};
pub use warm::{DecodedSnapshot, FlushOutcome, PendingChange, WarmCacheLoader, WarmCacheSnapshot};
