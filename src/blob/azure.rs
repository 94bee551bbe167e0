//! Azure Blob Storage backend using the REST API

use crate::blob::{BlobBackend, StoredBlob};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// Storage service version sent with every request
const API_VERSION: &str = "2021-08-06";

/// Blob container addressed by URL and authorised with a SAS token
#[derive(Debug, Clone)]
pub struct AzureBlobBackend {
    client: Client,
    container_url: Url,
    sas_token: Option<String>,
}

impl AzureBlobBackend {
    /// Create a backend for `https://<account>.blob.core.windows.net/<container>`
    pub fn new(container_url: &str, sas_token: Option<String>) -> Result<Self> {
        let container_url = Url::parse(container_url.trim_end_matches('/')).map_err(|e| {
            CacheError::ConfigError(format!("invalid container url '{}': {}", container_url, e))
        })?;
        if container_url.cannot_be_a_base() {
            return Err(CacheError::ConfigError(format!(
                "container url '{}' cannot hold blob paths",
                container_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            container_url,
            sas_token: sas_token
                .map(|t| t.trim_start_matches('?').to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    /// Full request URL for a blob, SAS token included
    pub fn blob_url(&self, name: &str) -> Result<Url> {
        let mut url = self.container_url.clone();
        url.path_segments_mut()
            .map_err(|_| CacheError::ConfigError("container url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(name.split('/').filter(|s| !s.is_empty()));
        url.set_query(self.sas_token.as_deref());
        Ok(url)
    }

    fn header(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn error_for(name: &str, response: reqwest::Response) -> CacheError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CacheError::BlobError(format!(
            "blob '{}' request failed with {}: {}",
            name,
            status,
            body.chars().take(512).collect::<String>()
        ))
    }
}

#[async_trait]
impl BlobBackend for AzureBlobBackend {
    async fn get(&self, name: &str) -> Result<Option<StoredBlob>> {
        let response = self
            .client
            .get(self.blob_url(name)?)
            .header("x-ms-version", API_VERSION)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let content_encoding = Self::header(response.headers(), CONTENT_ENCODING);
                let version = Self::header(response.headers(), ETAG);
                let bytes = response.bytes().await?.to_vec();
                debug!("Downloaded blob {} ({} bytes)", name, bytes.len());
                Ok(Some(StoredBlob {
                    bytes,
                    content_encoding,
                    version,
                }))
            }
            _ => Err(Self::error_for(name, response).await),
        }
    }

    async fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_encoding: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<String> {
        let size = bytes.len();
        let mut request = self
            .client
            .put(self.blob_url(name)?)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, "application/json");

        if let Some(encoding) = content_encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(expected) = if_match {
            request = request.header(IF_MATCH, expected);
        }

        let response = request.body(bytes).send().await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(CacheError::PreconditionFailed {
                blob: name.to_string(),
                expected: if_match.unwrap_or_default().to_string(),
            }),
            status if status.is_success() => {
                debug!("Uploaded blob {} ({} bytes)", name, size);
                Ok(Self::header(response.headers(), ETAG).unwrap_or_default())
            }
            _ => Err(Self::error_for(name, response).await),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.blob_url(name)?)
            .header("x-ms-version", API_VERSION)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(Self::error_for(name, response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_url_includes_path_and_sas() {
        let backend = AzureBlobBackend::new(
            "https://acct.blob.core.windows.net/faults/",
            Some("?sv=2021&sig=abc".to_string()),
        )
        .unwrap();

        let url = backend.blob_url("cache/warm cache.json").unwrap();
        assert_eq!(url.path(), "/faults/cache/warm%20cache.json");
        assert_eq!(url.query(), Some("sv=2021&sig=abc"));
    }

    #[test]
    fn test_blob_url_without_sas() {
        let backend =
            AzureBlobBackend::new("https://acct.blob.core.windows.net/faults", None).unwrap();
        let url = backend.blob_url("snapshot.json").unwrap();
        assert_eq!(url.as_str(), "https://acct.blob.core.windows.net/faults/snapshot.json");
    }

    #[test]
    fn test_invalid_container_url() {
        assert!(matches!(
            AzureBlobBackend::new("not a url", None),
            Err(CacheError::ConfigError(_))
        ));
    }
}
