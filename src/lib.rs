//! # faultline-core
//!
//! Caching core for the faultline analysis platform.
//!
//! ## Features
//!
//! - Hot in-memory tier with absolute/sliding expiration and size-weighted eviction
//! - Warm snapshot of the hot tier in blob storage (Azure, local directory or memory),
//!   gzip-compressed, loaded at startup and flushed back periodically
//! - Cold file tier: one JSON file per key with a background expiration sweep
//! - One-pass JSON repair for hand-edited or truncated cache files
//! - A single [`CacheService`](cache::CacheService) contract over every tier
//! - Log publishers (console and structured event sink) fed from `tracing`
//!
//! ## Example
//!
//! ```no_run
//! use faultline_core::cache::{CacheBackend, CacheService, CacheSettings, EntryOptions, JsonCodec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     faultline_core::telemetry::init_tracing("info");
//!
//!     let settings = CacheSettings::from_env()?;
//!     let codec = Arc::new(JsonCodec::new(settings.json.clone()));
//!     let cache = CacheBackend::from_settings(&settings, codec).await?;
//!
//!     cache.create_entry("embedding:doc-1", &vec![0.12f32, 0.98], EntryOptions::new()).await;
//!     let hit = cache.try_get::<Vec<f32>>("embedding:doc-1").await;
//!     println!("hit: {:?}", hit);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod cache;
pub mod error;
pub mod telemetry;

pub use cache::{CacheBackend, CacheService, CacheSettings, Cacheable, EntryOptions, JsonCodec};
pub use error::{CacheError, Result};
