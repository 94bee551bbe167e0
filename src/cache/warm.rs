//! Warm snapshot: load the hot tier from a blob at startup, flush it back periodically

use crate::blob::BlobObjectClient;
use crate::cache::config::BlobSettings;
use crate::cache::entry::{CacheEntryRecord, EntryOptions, PayloadKind};
use crate::cache::json::JsonCodec;
use crate::cache::key::KeyCodec;
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Flat mapping from key to record; the unit exchanged with blob storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarmCacheSnapshot {
    pub entries: BTreeMap<CacheKey, CacheEntryRecord>,
}

/// Result of decoding a snapshot blob entry by entry
#[derive(Debug, Default)]
pub struct DecodedSnapshot {
    pub snapshot: WarmCacheSnapshot,

    /// Keys whose entries could not be decoded
    pub skipped: Vec<CacheKey>,

    /// Keys whose expiration had already passed
    pub expired: Vec<CacheKey>,
}

impl WarmCacheSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: CacheEntryRecord) {
        self.entries.insert(record.key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries per payload kind
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.entries.values() {
            *counts.entry(record.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_bytes(&self, codec: &JsonCodec) -> Result<Vec<u8>> {
        codec.to_vec(self)
    }

    /// Decode a snapshot blob.
    ///
    /// Only a body that is not a JSON object fails as a whole; individual
    /// entries that do not decode or validate are skipped, and entries past
    /// their expiration at `now` are dropped.
    pub fn decode(bytes: &[u8], now: DateTime<Utc>) -> Result<DecodedSnapshot> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
        let mut decoded = DecodedSnapshot::default();

        for (key, value) in raw {
            match record_from_snapshot_value(&key, value) {
                Ok(record) if record.is_expired_at(now) => decoded.expired.push(key),
                Ok(record) => decoded.snapshot.insert(record),
                Err(e) => {
                    warn!("Skipping warm cache entry {}: {}", key, e);
                    decoded.skipped.push(key);
                }
            }
        }

        Ok(decoded)
    }
}

/// Decode one snapshot entry.
///
/// Full records are validated against their recorded kind. A bare JSON value
/// is accepted too, with its kind inferred from its shape.
fn record_from_snapshot_value(key: &str, value: serde_json::Value) -> Result<CacheEntryRecord> {
    let is_record = value
        .as_object()
        .map(|o| o.contains_key("serialized_value") && o.contains_key("kind"))
        .unwrap_or(false);

    let mut record = if is_record {
        serde_json::from_value::<CacheEntryRecord>(value)?
    } else {
        let kind = infer_kind(&value);
        CacheEntryRecord::new(key, kind, serde_json::to_string(&value)?, EntryOptions::new())?
    };

    if record.key != key {
        debug!("Warm cache entry {} carried key {}; using map key", key, record.key);
        record.key = key.to_string();
    }
    record.validate()?;
    Ok(record)
}

fn infer_kind(value: &serde_json::Value) -> PayloadKind {
    if PayloadKind::Text.validate(value).is_ok() {
        PayloadKind::Text
    } else if PayloadKind::Embedding.validate(value).is_ok() {
        PayloadKind::Embedding
    } else if PayloadKind::Structured.validate(value).is_ok() {
        PayloadKind::Structured
    } else {
        PayloadKind::Json
    }
}

/// Change recorded in the write-behind buffer since the last flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Written(DateTime<Utc>),
    Removed(DateTime<Utc>),
}

/// What a flush did
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing changed since the last flush
    Skipped,

    /// Snapshot uploaded.
    ///
    /// `adopted` holds records another writer had added to the remote
    /// snapshot; they were merged into the upload after a version conflict.
    Uploaded {
        entries: usize,
        version: String,
        adopted: Vec<CacheEntryRecord>,
    },
}

/// Loads the warm snapshot into the hot tier and writes it back.
///
/// Writes and removals on the hot tier are mirrored into a write-behind
/// buffer; a flush uploads the full hot-tier content when that buffer is not
/// empty. The remote snapshot is last-write-wins across processes unless
/// optimistic concurrency is enabled; then a version conflict re-reads the
/// remote snapshot, merges entries this process has not written or removed,
/// and retries the upload once against the fresh version.
pub struct WarmCacheLoader {
    client: BlobObjectClient,
    blob_name: String,
    codec: Arc<JsonCodec>,
    optimistic_concurrency: bool,
    pending: DashMap<CacheKey, PendingChange>,
    last_version: Mutex<Option<String>>,
}

impl std::fmt::Debug for WarmCacheLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmCacheLoader")
            .field("blob_name", &self.blob_name)
            .field("optimistic_concurrency", &self.optimistic_concurrency)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl WarmCacheLoader {
    pub fn new(client: BlobObjectClient, blob_name: impl Into<String>, codec: Arc<JsonCodec>) -> Self {
        Self {
            client,
            blob_name: blob_name.into(),
            codec,
            optimistic_concurrency: false,
            pending: DashMap::new(),
            last_version: Mutex::new(None),
        }
    }

    /// Build a loader for the snapshot blob named by `settings`
    pub fn from_settings(settings: &BlobSettings, codec: Arc<JsonCodec>) -> Result<Self> {
        if settings.snapshot_name.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "snapshot_name must not be empty".to_string(),
            ));
        }
        let client = BlobObjectClient::from_settings(settings)?;
        let blob_name = KeyCodec::blob_path(&settings.prefix, &settings.snapshot_name);
        Ok(Self::new(client, blob_name, codec)
            .with_optimistic_concurrency(settings.optimistic_concurrency))
    }

    /// Refuse to overwrite a snapshot written by someone else since our last read
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.optimistic_concurrency = enabled;
        self
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Download and decode the snapshot; an absent blob is an empty snapshot
    pub async fn load(&self) -> Result<DecodedSnapshot> {
        let Some((bytes, version)) = self.client.get_versioned(&self.blob_name).await? else {
            info!("No warm cache snapshot at {}", self.blob_name);
            return Ok(DecodedSnapshot::default());
        };

        *self.last_version.lock().await = version;

        let decoded = WarmCacheSnapshot::decode(&bytes, Utc::now())?;
        info!(
            "Loaded warm cache snapshot {} ({} entries, {} skipped, {} expired)",
            self.blob_name,
            decoded.snapshot.len(),
            decoded.skipped.len(),
            decoded.expired.len()
        );
        Ok(decoded)
    }

    /// Mirror a hot-tier write into the write-behind buffer
    pub fn record_write(&self, record: &CacheEntryRecord) {
        self.pending
            .insert(record.key.clone(), PendingChange::Written(record.created_at));
    }

    /// Mirror a hot-tier removal into the write-behind buffer
    pub fn record_removal(&self, key: &str) {
        self.pending
            .insert(key.to_string(), PendingChange::Removed(Utc::now()));
    }

    /// Number of changes not yet flushed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_change(&self, key: &str) -> Option<PendingChange> {
        self.pending.get(key).map(|c| *c.value())
    }

    /// Upload the snapshot built by `snapshot` if anything changed since the
    /// last flush
    pub async fn flush_if_dirty<F>(&self, snapshot: F) -> Result<FlushOutcome>
    where
        F: FnOnce() -> WarmCacheSnapshot,
    {
        if self.pending.is_empty() {
            debug!("Warm cache clean; skipping flush of {}", self.blob_name);
            return Ok(FlushOutcome::Skipped);
        }
        self.flush(snapshot).await
    }

    /// Upload the snapshot built by `snapshot` unconditionally
    pub async fn flush<F>(&self, snapshot: F) -> Result<FlushOutcome>
    where
        F: FnOnce() -> WarmCacheSnapshot,
    {
        let mut last_version = self.last_version.lock().await;

        // Drain before building the snapshot so later writes stay pending
        let drained: Vec<(CacheKey, PendingChange)> = self
            .pending
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (key, _) in &drained {
            self.pending.remove(key);
        }

        let mut snapshot = snapshot();
        let mut adopted = Vec::new();
        let mut result = self.upload(&snapshot, last_version.as_deref()).await;

        let conflict = match &result {
            Err(CacheError::PreconditionFailed { expected, .. }) => Some(expected.clone()),
            _ => None,
        };
        if let Some(expected) = conflict {
            warn!(
                "Warm cache snapshot {} changed remotely (expected version {}); merging and retrying",
                self.blob_name, expected
            );
            result = match self.client.get_versioned(&self.blob_name).await {
                Ok(remote) => {
                    let (remote, version) = match remote {
                        Some((bytes, version)) => (self.decode_remote(&bytes), version),
                        None => (WarmCacheSnapshot::new(), None),
                    };
                    adopted = self.merge_remote(&mut snapshot, remote, &drained);
                    *last_version = version;
                    self.upload(&snapshot, last_version.as_deref()).await
                }
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(version) => {
                info!(
                    "Flushed warm cache snapshot {} ({} entries, {} adopted)",
                    self.blob_name,
                    snapshot.len(),
                    adopted.len()
                );
                *last_version = Some(version.clone());
                Ok(FlushOutcome::Uploaded {
                    entries: snapshot.len(),
                    version,
                    adopted,
                })
            }
            Err(e) => {
                for (key, change) in drained {
                    self.pending.entry(key).or_insert(change);
                }
                Err(e)
            }
        }
    }

    async fn upload(&self, snapshot: &WarmCacheSnapshot, version: Option<&str>) -> Result<String> {
        let bytes = snapshot.to_bytes(&self.codec)?;
        let precondition = if self.optimistic_concurrency {
            version
        } else {
            None
        };
        self.client.put(&self.blob_name, &bytes, precondition).await
    }

    fn decode_remote(&self, bytes: &[u8]) -> WarmCacheSnapshot {
        match WarmCacheSnapshot::decode(bytes, Utc::now()) {
            Ok(decoded) => decoded.snapshot,
            Err(e) => {
                warn!("Remote warm cache snapshot {} unreadable: {}", self.blob_name, e);
                WarmCacheSnapshot::new()
            }
        }
    }

    /// Copy remote-only entries into `local`, skipping keys this process
    /// removed; returns the copied records
    fn merge_remote(
        &self,
        local: &mut WarmCacheSnapshot,
        remote: WarmCacheSnapshot,
        drained: &[(CacheKey, PendingChange)],
    ) -> Vec<CacheEntryRecord> {
        let removed_here = |key: &str| {
            drained
                .iter()
                .any(|(k, c)| k == key && matches!(c, PendingChange::Removed(_)))
                || matches!(self.pending_change(key), Some(PendingChange::Removed(_)))
        };

        let mut adopted = Vec::new();
        for (key, record) in remote.entries {
            if local.entries.contains_key(&key) || removed_here(&key) {
                continue;
            }
            adopted.push(record.clone());
            local.entries.insert(key, record);
        }
        adopted
    }

    /// Delete the remote snapshot
    pub async fn clear_remote(&self) -> Result<()> {
        self.client.delete(&self.blob_name).await?;
        *self.last_version.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobBackend;

    fn text_record(key: &str, value: &str) -> CacheEntryRecord {
        CacheEntryRecord::from_value(key, &value.to_string(), EntryOptions::new(), &JsonCodec::default())
            .unwrap()
    }

    fn loader(backend: Arc<MemoryBlobBackend>) -> WarmCacheLoader {
        WarmCacheLoader::new(
            BlobObjectClient::new(backend),
            "cache/warm.json",
            Arc::new(JsonCodec::default()),
        )
    }

    #[test]
    fn test_decode_bare_values() {
        let decoded =
            WarmCacheSnapshot::decode(br#"{"a": "1", "v": [0.5, 1.0], "o": {"x": 1}}"#, Utc::now())
                .unwrap();

        let entries = &decoded.snapshot.entries;
        assert_eq!(entries["a"].kind, PayloadKind::Text);
        assert_eq!(entries["a"].decode::<String>().unwrap(), "1");
        assert_eq!(entries["v"].kind, PayloadKind::Embedding);
        assert_eq!(entries["o"].kind, PayloadKind::Structured);
        assert!(decoded.skipped.is_empty());
    }

    #[test]
    fn test_decode_skips_bad_entries_individually() {
        let good = text_record("good", "ok");
        let mut bad = serde_json::to_value(text_record("bad", "x")).unwrap();
        bad["kind"] = serde_json::json!("embedding");
        let body = serde_json::json!({
            "good": serde_json::to_value(&good).unwrap(),
            "bad": bad,
            "null": null,
        });

        let decoded = WarmCacheSnapshot::decode(body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(decoded.snapshot.len(), 1);
        assert!(decoded.snapshot.entries.contains_key("good"));
        assert_eq!(decoded.skipped.len(), 2);
    }

    #[test]
    fn test_decode_drops_expired_entries() {
        let mut record = text_record("old", "x");
        record.options.absolute_expiration = Some(Utc::now() - chrono::Duration::minutes(1));
        let mut snapshot = WarmCacheSnapshot::new();
        snapshot.insert(record);

        let bytes = snapshot.to_bytes(&JsonCodec::default()).unwrap();
        let decoded = WarmCacheSnapshot::decode(&bytes, Utc::now()).unwrap();
        assert!(decoded.snapshot.is_empty());
        assert_eq!(decoded.expired, vec!["old".to_string()]);
    }

    #[test]
    fn test_decode_rejects_non_object_body() {
        assert!(WarmCacheSnapshot::decode(b"[1,2,3]", Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_blob_is_empty() {
        let loader = loader(Arc::new(MemoryBlobBackend::new()));
        let decoded = loader.load().await.unwrap();
        assert!(decoded.snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_flush_round_trip() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let loader = loader(backend.clone());

        let record = text_record("a", "1");
        loader.record_write(&record);
        assert_eq!(loader.pending_len(), 1);

        let outcome = loader
            .flush_if_dirty(|| {
                let mut s = WarmCacheSnapshot::new();
                s.insert(record.clone());
                s
            })
            .await
            .unwrap();
        assert!(matches!(outcome, FlushOutcome::Uploaded { entries: 1, .. }));
        assert_eq!(loader.pending_len(), 0);

        let outcome = loader.flush_if_dirty(WarmCacheSnapshot::new).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Skipped);
        assert_eq!(backend.put_count(), 1);

        let decoded = loader.load().await.unwrap();
        assert_eq!(decoded.snapshot.entries["a"], record);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_changes_pending() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let writer = loader(backend.clone()).with_optimistic_concurrency(true);

        writer.record_write(&text_record("a", "1"));
        backend.fail_puts(true);
        assert!(writer.flush(WarmCacheSnapshot::new).await.is_err());
        assert!(matches!(
            writer.pending_change("a"),
            Some(PendingChange::Written(_))
        ));

        backend.fail_puts(false);
        writer.flush(WarmCacheSnapshot::new).await.unwrap();
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_version_conflict_merges_and_keeps_flushing() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let writer = loader(backend.clone()).with_optimistic_concurrency(true);
        let other = loader(backend.clone());

        let a = text_record("a", "1");
        let gone = text_record("gone", "x");
        writer.record_write(&a);
        writer
            .flush(|| {
                let mut s = WarmCacheSnapshot::new();
                s.insert(a.clone());
                s.insert(gone.clone());
                s
            })
            .await
            .unwrap();

        // Another process rewrites the snapshot with its own entries
        let b = text_record("b", "2");
        other
            .flush(|| {
                let mut s = WarmCacheSnapshot::new();
                s.insert(b.clone());
                s.insert(gone.clone());
                s
            })
            .await
            .unwrap();

        writer.record_removal("gone");
        let outcome = writer
            .flush(|| {
                let mut s = WarmCacheSnapshot::new();
                s.insert(a.clone());
                s
            })
            .await
            .unwrap();
        match outcome {
            FlushOutcome::Uploaded { entries, adopted, .. } => {
                assert_eq!(entries, 2);
                assert_eq!(adopted, vec![b.clone()]);
            }
            unexpected => panic!("unexpected outcome {:?}", unexpected),
        }
        assert_eq!(writer.pending_len(), 0);

        let remote = writer.load().await.unwrap().snapshot;
        assert!(remote.entries.contains_key("a"));
        assert!(remote.entries.contains_key("b"));
        assert!(!remote.entries.contains_key("gone"));

        // Later flushes succeed against the refreshed version
        for i in 0..5 {
            writer.record_write(&text_record("a", &i.to_string()));
            let outcome = writer.flush_if_dirty(WarmCacheSnapshot::new).await.unwrap();
            assert!(matches!(outcome, FlushOutcome::Uploaded { .. }));
        }
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_from_settings_builds_prefixed_blob_name() {
        let settings = BlobSettings {
            backend: crate::cache::config::BlobBackendKind::Memory,
            prefix: "faults".to_string(),
            snapshot_name: "hot.json".to_string(),
            ..Default::default()
        };
        let loader = WarmCacheLoader::from_settings(&settings, Arc::new(JsonCodec::default())).unwrap();
        assert_eq!(loader.blob_name(), "faults/hot.json");
    }
}
