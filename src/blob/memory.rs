//! In-process blob backend

use crate::blob::{BlobBackend, StoredBlob};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Blob container held in memory.
///
/// Counts every call so tests can assert when the remote store was touched.
#[derive(Debug, Default)]
pub struct MemoryBlobBackend {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    next_version: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    fail_puts: AtomicBool,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of successful `put` calls
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every `put` fail as if the remote store were unreachable
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Raw stored blob, bypassing the counters
    pub async fn raw(&self, name: &str) -> Option<StoredBlob> {
        self.blobs.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn get(&self, name: &str) -> Result<Option<StoredBlob>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.blobs.lock().await.get(name).cloned())
    }

    async fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_encoding: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<String> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CacheError::BlobError(format!("{}: store unavailable", name)));
        }
        let mut blobs = self.blobs.lock().await;

        if let Some(expected) = if_match {
            let current = blobs.get(name).and_then(|b| b.version.as_deref());
            if current != Some(expected) {
                return Err(CacheError::PreconditionFailed {
                    blob: name.to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        let version = format!("\"{}\"", self.next_version.fetch_add(1, Ordering::SeqCst) + 1);
        blobs.insert(
            name.to_string(),
            StoredBlob {
                bytes,
                content_encoding: content_encoding.map(str::to_string),
                version: Some(version.clone()),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);

        Ok(version)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().await.remove(name);
        Ok(())
    }
}
