//! Compressing client over a [`BlobBackend`]

use crate::blob::{AzureBlobBackend, BlobBackend, FsBlobBackend, MemoryBlobBackend};
use crate::cache::config::{BlobBackendKind, BlobSettings};
use crate::error::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Content-encoding marker written with every upload
pub const GZIP_ENCODING: &str = "gzip";

/// Get/put/delete of opaque byte blobs with transparent gzip compression
#[derive(Clone)]
pub struct BlobObjectClient {
    backend: Arc<dyn BlobBackend>,
}

impl std::fmt::Debug for BlobObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobObjectClient").finish_non_exhaustive()
    }
}

impl BlobObjectClient {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self { backend }
    }

    /// Build the backend named by the settings
    pub fn from_settings(settings: &BlobSettings) -> Result<Self> {
        let backend: Arc<dyn BlobBackend> = match settings.backend {
            BlobBackendKind::Azure => {
                let url = settings.container_url.as_deref().ok_or_else(|| {
                    CacheError::ConfigError("azure blob backend requires container_url".to_string())
                })?;
                Arc::new(AzureBlobBackend::new(url, settings.sas_token.clone())?)
            }
            BlobBackendKind::Filesystem => {
                let dir = settings.directory.clone().ok_or_else(|| {
                    CacheError::ConfigError(
                        "filesystem blob backend requires a directory".to_string(),
                    )
                })?;
                Arc::new(FsBlobBackend::new(dir))
            }
            BlobBackendKind::Memory => Arc::new(MemoryBlobBackend::new()),
        };
        Ok(Self::new(backend))
    }

    /// Download a blob, inflating it when it was stored gzip-encoded
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_versioned(key).await?.map(|(bytes, _)| bytes))
    }

    /// Like [`get`](Self::get), also returning the stored version token
    pub async fn get_versioned(&self, key: &str) -> Result<Option<(Vec<u8>, Option<String>)>> {
        let Some(blob) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let version = blob.version.clone();

        let compressed = blob
            .content_encoding
            .as_deref()
            .map(|e| e.trim().eq_ignore_ascii_case(GZIP_ENCODING))
            .unwrap_or(false);

        if compressed {
            let bytes = decompress(&blob.bytes)?;
            debug!(
                "Fetched blob {} ({} bytes, {} compressed)",
                key,
                bytes.len(),
                blob.bytes.len()
            );
            Ok(Some((bytes, version)))
        } else {
            Ok(Some((blob.bytes, version)))
        }
    }

    /// Compress and upload a blob, returning its new version token
    pub async fn put(&self, key: &str, bytes: &[u8], precondition: Option<&str>) -> Result<String> {
        let compressed = compress(bytes)?;
        debug!(
            "Uploading blob {} ({} bytes, {} compressed)",
            key,
            bytes.len(),
            compressed.len()
        );
        self.backend
            .put(key, compressed, Some(GZIP_ENCODING), precondition)
            .await
    }

    /// Delete a blob; missing blobs are not an error
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    /// Version token of the stored blob, if it exists
    pub async fn version(&self, key: &str) -> Result<Option<String>> {
        Ok(self.backend.get(key).await?.and_then(|b| b.version))
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::BlobError(format!("failed to inflate blob: {}", e)))?;
    Ok(out)
}
