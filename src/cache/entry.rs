//! Cache entry records, payload kinds and per-entry options

use crate::cache::json::JsonCodec;
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of payload shapes the warm tier knows how to decode.
///
/// Each record carries its kind so an untyped snapshot can be checked and
/// re-materialized without resolving types by name at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A JSON string (chat completions, prompts, rendered summaries)
    Text,

    /// A JSON array of numbers (embedding vectors)
    Embedding,

    /// A JSON object (domain records such as analysis summaries)
    Structured,

    /// Any non-null JSON value
    Json,
}

impl PayloadKind {
    /// Check that a decoded JSON value has the shape this kind promises
    pub fn validate(&self, value: &serde_json::Value) -> Result<()> {
        let ok = match self {
            PayloadKind::Text => value.is_string(),
            PayloadKind::Embedding => value
                .as_array()
                .map(|items| items.iter().all(|v| v.is_number()))
                .unwrap_or(false),
            PayloadKind::Structured => value.is_object(),
            PayloadKind::Json => !value.is_null(),
        };

        if ok {
            Ok(())
        } else {
            Err(CacheError::SerializationError(format!(
                "payload does not match kind {}",
                self
            )))
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Embedding => write!(f, "embedding"),
            PayloadKind::Structured => write!(f, "structured"),
            PayloadKind::Json => write!(f, "json"),
        }
    }
}

/// A value that can be stored in any cache tier.
///
/// Domain types opt in with `const KIND: PayloadKind = PayloadKind::Structured;`.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Shape recorded alongside the serialized value
    const KIND: PayloadKind;
}

impl Cacheable for String {
    const KIND: PayloadKind = PayloadKind::Text;
}

impl Cacheable for Vec<f32> {
    const KIND: PayloadKind = PayloadKind::Embedding;
}

impl Cacheable for Vec<f64> {
    const KIND: PayloadKind = PayloadKind::Embedding;
}

impl Cacheable for serde_json::Value {
    const KIND: PayloadKind = PayloadKind::Json;
}

/// Eviction hint passed through to the hot-tier engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    NeverRemove,
}

/// Per-entry expiration and eviction hints.
///
/// The expiration policies are not mutually exclusive: whichever fires first
/// evicts the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryOptions {
    /// Fixed point in time after which the entry is gone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_expiration: Option<DateTime<Utc>>,

    /// Lifetime measured from creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_expiration_relative_to_now: Option<Duration>,

    /// Idle window renewed on every read (hot tier only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding_expiration: Option<Duration>,

    #[serde(default)]
    pub priority: CachePriority,

    /// Caller-estimated size used as the hot-tier weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire at a fixed instant
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    /// Expire after a lifetime measured from creation
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.absolute_expiration_relative_to_now = Some(ttl);
        self
    }

    /// Expire after being idle for `window`
    pub fn sliding(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Earliest absolute deadline implied by these options, if any
    pub fn effective_deadline(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let relative = self
            .absolute_expiration_relative_to_now
            .map(|ttl| add_std(created_at, ttl));

        match (self.absolute_expiration, relative) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }
}

/// Add a std duration to a UTC timestamp, saturating at the maximum representable time
pub(crate) fn add_std(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A cached payload with its kind and expiration metadata.
///
/// This is the unit stored in the hot tier and exchanged with the warm snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryRecord {
    /// The cache key
    pub key: CacheKey,

    /// The payload encoded as JSON text
    pub serialized_value: String,

    /// Shape of the payload, used to decode it without a concrete type at hand
    pub kind: PayloadKind,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub options: EntryOptions,
}

impl CacheEntryRecord {
    /// Build a record from already-serialized JSON.
    ///
    /// An empty payload or a JSON `null` is a misuse of the API and is rejected.
    pub fn new(
        key: impl Into<CacheKey>,
        kind: PayloadKind,
        serialized_value: String,
        options: EntryOptions,
    ) -> Result<Self> {
        let key = key.into();
        let trimmed = serialized_value.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Err(CacheError::InvalidArgument(format!(
                "cache entry '{}' cannot be created from a null value",
                key
            )));
        }

        Ok(Self {
            key,
            serialized_value,
            kind,
            created_at: Utc::now(),
            options,
        })
    }

    /// Serialize `value` and build a record for it
    pub fn from_value<T: Cacheable>(
        key: impl Into<CacheKey>,
        value: &T,
        options: EntryOptions,
        codec: &JsonCodec,
    ) -> Result<Self> {
        let serialized = codec.to_string(value)?;
        Self::new(key, T::KIND, serialized, options)
    }

    /// Decode the payload as `T`, refusing a kind mismatch
    pub fn decode<T: Cacheable>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(CacheError::SerializationError(format!(
                "entry '{}' holds {} but {} was requested",
                self.key,
                self.kind,
                T::KIND
            )));
        }
        Ok(serde_json::from_str(&self.serialized_value)?)
    }

    /// Check that the payload parses and matches its recorded kind
    pub fn validate(&self) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(&self.serialized_value)?;
        self.kind.validate(&value)
    }

    /// Earliest absolute deadline for this record
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.options.effective_deadline(self.created_at)
    }

    /// Whether the absolute deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline().map(|d| d <= now).unwrap_or(false)
    }

    /// Approximate weight of the record in bytes
    pub fn calculate_size(&self) -> u64 {
        self.options
            .size
            .unwrap_or((self.key.len() + self.serialized_value.len()) as u64)
    }
}
