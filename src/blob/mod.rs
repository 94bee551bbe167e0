//! # Blob storage for the warm cache snapshot
//!
//! A [`BlobBackend`] moves raw bytes plus a content-encoding marker and a
//! version token. [`BlobObjectClient`] sits on top and gzips every upload,
//! inflating on download only when the stored marker says so.
//!
//! Backends:
//! - [`AzureBlobBackend`]: Azure Blob REST API over `reqwest` (container URL + SAS token)
//! - [`FsBlobBackend`]: a local directory standing in for a container
//! - [`MemoryBlobBackend`]: process memory, for tests and local runs

pub mod azure;
pub mod client;
pub mod fs;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;

pub use azure::AzureBlobBackend;
pub use client::{BlobObjectClient, GZIP_ENCODING};
pub use fs::FsBlobBackend;
pub use memory::MemoryBlobBackend;

/// Raw blob as held by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,

    /// Stored `Content-Encoding`, if any
    pub content_encoding: Option<String>,

    /// Opaque version token (ETag)
    pub version: Option<String>,
}

/// Byte-level access to a blob container.
///
/// Implementations do no caching and no retries of their own.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Fetch a blob; `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<StoredBlob>>;

    /// Store a blob, returning its new version token.
    ///
    /// With `if_match` set the write fails with
    /// [`CacheError::PreconditionFailed`](crate::error::CacheError::PreconditionFailed)
    /// unless the current version equals it.
    async fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_encoding: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<String>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, name: &str) -> Result<()>;
}
