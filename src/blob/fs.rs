//! Directory-backed blob backend
//!
//! Each blob is a file under the root directory; its encoding and version live
//! in a JSON sidecar named `<blob>.meta.json`.

use crate::blob::{BlobBackend, StoredBlob};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    version: String,
}

/// Blob container stored in a local directory
#[derive(Debug)]
pub struct FsBlobBackend {
    root: PathBuf,
    write_gate: Mutex<()>,
}

impl FsBlobBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(CacheError::InvalidArgument(format!(
                "blob name '{}' is not a plain relative path",
                name
            )));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(blob_path: &Path) -> PathBuf {
        let mut os = blob_path.as_os_str().to_os_string();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }

    async fn read_meta(path: &Path) -> Result<Option<BlobMeta>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobBackend for FsBlobBackend {
    async fn get(&self, name: &str) -> Result<Option<StoredBlob>> {
        let path = self.blob_path(name)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta = Self::read_meta(&Self::meta_path(&path)).await?;
        Ok(Some(StoredBlob {
            bytes,
            content_encoding: meta.as_ref().and_then(|m| m.content_encoding.clone()),
            version: meta.map(|m| m.version),
        }))
    }

    async fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_encoding: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<String> {
        let path = self.blob_path(name)?;
        let meta_path = Self::meta_path(&path);
        let _guard = self.write_gate.lock().await;

        if let Some(expected) = if_match {
            let current = Self::read_meta(&meta_path).await?;
            if current.as_ref().map(|m| m.version.as_str()) != Some(expected) {
                return Err(CacheError::PreconditionFailed {
                    blob: name.to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let version = format!("\"{}\"", uuid::Uuid::new_v4().simple());
        let meta = BlobMeta {
            content_encoding: content_encoding.map(str::to_string),
            version: version.clone(),
        };

        // Write to a temp file first so readers never observe a partial blob
        let tmp = Self::meta_path(&path).with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

        debug!("Stored blob {} ({} bytes) at {:?}", name, bytes.len(), path);
        Ok(version)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name)?;
        let _guard = self.write_gate.lock().await;

        for target in [Self::meta_path(&path), path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_with_nested_name() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBlobBackend::new(tmp.path());

        let version = backend
            .put("cache/warm.json", b"{}".to_vec(), Some("gzip"), None)
            .await
            .unwrap();

        let blob = backend.get("cache/warm.json").await.unwrap().unwrap();
        assert_eq!(blob.bytes, b"{}");
        assert_eq!(blob.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(blob.version, Some(version));
        assert!(tmp.path().join("cache").join("warm.json").exists());
    }

    #[tokio::test]
    async fn test_missing_blob_and_idempotent_delete() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBlobBackend::new(tmp.path());

        assert!(backend.get("nope").await.unwrap().is_none());
        backend.delete("nope").await.unwrap();

        backend.put("x", b"1".to_vec(), None, None).await.unwrap();
        backend.delete("x").await.unwrap();
        backend.delete("x").await.unwrap();
        assert!(backend.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_precondition_failure() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBlobBackend::new(tmp.path());

        let v1 = backend.put("x", b"1".to_vec(), None, None).await.unwrap();
        backend.put("x", b"2".to_vec(), None, None).await.unwrap();

        let result = backend.put("x", b"3".to_vec(), None, Some(&v1)).await;
        assert!(matches!(result, Err(CacheError::PreconditionFailed { .. })));
        assert_eq!(backend.get("x").await.unwrap().unwrap().bytes, b"2");
    }

    #[tokio::test]
    async fn test_path_escape_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBlobBackend::new(tmp.path());

        assert!(backend.get("../outside").await.is_err());
        assert!(backend.put("/abs", vec![], None, None).await.is_err());
    }
}
