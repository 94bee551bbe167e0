//! Configuration for the cache system
//!
//! Settings arrive already parsed: either built in code with
//! [`CacheSettings::builder`] or read from `FAULTLINE_CACHE_*` environment
//! variables (a `.env` file is honoured) with [`CacheSettings::from_env`].

use crate::cache::json::JsonOptions;
use crate::cache::types::CacheTier;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment variable read by [`CacheSettings::from_env`]
pub const ENV_PREFIX: &str = "FAULTLINE_CACHE_";

/// How file-tier entries found on disk at startup get their expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartExpiry {
    /// Honour the remaining lifetime: expire at file mtime + default expiration
    #[default]
    FromModifiedTime,

    /// Restart the clock: expire at scan time + default expiration
    FromScanTime,
}

impl FromStr for RestartExpiry {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modified" | "mtime" | "from_modified_time" => Ok(RestartExpiry::FromModifiedTime),
            "scan" | "from_scan_time" => Ok(RestartExpiry::FromScanTime),
            other => Err(format!("unknown restart expiry policy: {}", other)),
        }
    }
}

/// Where the warm snapshot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackendKind {
    /// Azure Blob Storage container addressed by URL + SAS token
    #[default]
    Azure,

    /// Local directory standing in for a container
    Filesystem,

    /// Process memory (tests and local runs)
    Memory,
}

impl FromStr for BlobBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(BlobBackendKind::Azure),
            "filesystem" | "fs" | "file" => Ok(BlobBackendKind::Filesystem),
            "memory" => Ok(BlobBackendKind::Memory),
            other => Err(format!("unknown blob backend: {}", other)),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// File tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCacheSettings {
    /// Cache directory; relative paths resolve under the system temp directory
    pub directory: Option<PathBuf>,

    /// Cadence of the background sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Lifetime applied when an entry is written without an expiration
    #[serde(with = "duration_secs")]
    pub default_expiration: Duration,

    pub restart_expiry: RestartExpiry,
}

impl Default for FileCacheSettings {
    fn default() -> Self {
        Self {
            directory: None,
            sweep_interval: Duration::from_secs(60),
            default_expiration: Duration::from_secs(24 * 3600),
            restart_expiry: RestartExpiry::default(),
        }
    }
}

impl FileCacheSettings {
    /// Resolve the directory the file tier writes to.
    ///
    /// Rooted paths are used as-is, relative paths live under the system temp
    /// directory, and an unset path falls back to the per-user local data
    /// directory.
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) if dir.as_os_str().is_empty() => Err(CacheError::ConfigError(
                "file cache directory is set but empty".to_string(),
            )),
            Some(dir) if dir.is_absolute() => Ok(dir.clone()),
            Some(dir) => Ok(std::env::temp_dir().join(dir)),
            None => dirs::data_local_dir()
                .map(|base| base.join("faultline").join("cache"))
                .ok_or_else(|| {
                    CacheError::ConfigError(
                        "no local data directory available; set a cache directory".to_string(),
                    )
                }),
        }
    }
}

/// Hot tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryCacheSettings {
    /// Total weight the hot tier may hold before the engine evicts
    pub max_capacity: u64,

    /// Populate from and flush to the warm snapshot
    pub use_warm_loader: bool,

    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,

    #[serde(with = "duration_secs")]
    pub flush_initial_delay: Duration,

    /// Random spread applied to the flush interval (0.0 - 1.0)
    pub flush_jitter: f64,
}

impl Default for MemoryCacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 256 * 1024 * 1024,
            use_warm_loader: false,
            flush_interval: Duration::from_secs(300),
            flush_initial_delay: Duration::from_secs(60),
            flush_jitter: 0.1,
        }
    }
}

impl MemoryCacheSettings {
    /// Flush interval with jitter applied, so that several processes sharing a
    /// snapshot do not flush in lockstep
    pub fn flush_interval_with_jitter(&self) -> Duration {
        if self.flush_jitter == 0.0 {
            return self.flush_interval;
        }

        let base_secs = self.flush_interval.as_secs_f64();
        let jitter_range = base_secs * self.flush_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Warm snapshot storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobSettings {
    pub backend: BlobBackendKind,

    /// `https://<account>.blob.core.windows.net/<container>`
    pub container_url: Option<String>,

    /// SAS token appended to every request
    pub sas_token: Option<String>,

    /// Root directory for the filesystem backend
    pub directory: Option<PathBuf>,

    /// Path prefix inside the container
    pub prefix: String,

    /// Name of the snapshot blob under `prefix`
    pub snapshot_name: String,

    /// Send the last seen version with every flush and refuse to overwrite
    /// another writer's snapshot
    pub optimistic_concurrency: bool,
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            backend: BlobBackendKind::default(),
            container_url: None,
            sas_token: None,
            directory: None,
            prefix: "cache".to_string(),
            snapshot_name: "warm-cache.json".to_string(),
            optimistic_concurrency: false,
        }
    }
}

/// Top-level cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Master switch; when off every operation degrades to a miss or no-op
    pub enabled: bool,

    pub tier: CacheTier,

    #[serde(default)]
    pub json: JsonOptions,

    #[serde(default)]
    pub file: FileCacheSettings,

    #[serde(default)]
    pub memory: MemoryCacheSettings,

    #[serde(default)]
    pub blob: BlobSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tier: CacheTier::default(),
            json: JsonOptions::default(),
            file: FileCacheSettings::default(),
            memory: MemoryCacheSettings::default(),
            blob: BlobSettings::default(),
        }
    }
}

impl CacheSettings {
    /// Create a new builder for cache settings
    pub fn builder() -> CacheSettingsBuilder {
        CacheSettingsBuilder::default()
    }

    /// Read settings from the process environment, loading `.env` first
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    ///
    /// Names are passed with the [`ENV_PREFIX`] already applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.trim().is_empty())
        };

        let mut settings = CacheSettings::default();

        if let Some(v) = get("ENABLED") {
            settings.enabled = parse_bool("ENABLED", &v)?;
        }
        if let Some(v) = get("TIER") {
            settings.tier = parse_with("TIER", &v)?;
        }
        if let Some(v) = get("PRETTY_JSON") {
            settings.json.pretty = parse_bool("PRETTY_JSON", &v)?;
        }

        if let Some(v) = get("DIRECTORY") {
            settings.file.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECS") {
            settings.file.sweep_interval = parse_secs("SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DEFAULT_EXPIRATION_SECS") {
            settings.file.default_expiration = parse_secs("DEFAULT_EXPIRATION_SECS", &v)?;
        }
        if let Some(v) = get("RESTART_EXPIRY") {
            settings.file.restart_expiry = parse_with("RESTART_EXPIRY", &v)?;
        }

        if let Some(v) = get("MAX_CAPACITY") {
            settings.memory.max_capacity = parse_with("MAX_CAPACITY", &v)?;
        }
        if let Some(v) = get("USE_WARM_LOADER") {
            settings.memory.use_warm_loader = parse_bool("USE_WARM_LOADER", &v)?;
        }
        if let Some(v) = get("FLUSH_INTERVAL_SECS") {
            settings.memory.flush_interval = parse_secs("FLUSH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("FLUSH_INITIAL_DELAY_SECS") {
            settings.memory.flush_initial_delay = parse_secs("FLUSH_INITIAL_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("FLUSH_JITTER") {
            settings.memory.flush_jitter = parse_with("FLUSH_JITTER", &v)?;
        }

        if let Some(v) = get("BLOB_BACKEND") {
            settings.blob.backend = parse_with("BLOB_BACKEND", &v)?;
        }
        settings.blob.container_url = get("BLOB_CONTAINER_URL");
        settings.blob.sas_token = get("BLOB_SAS_TOKEN");
        if let Some(v) = get("BLOB_DIRECTORY") {
            settings.blob.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BLOB_PREFIX") {
            settings.blob.prefix = v;
        }
        if let Some(v) = get("SNAPSHOT_NAME") {
            settings.blob.snapshot_name = v;
        }
        if let Some(v) = get("OPTIMISTIC_CONCURRENCY") {
            settings.blob.optimistic_concurrency = parse_bool("OPTIMISTIC_CONCURRENCY", &v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.file.sweep_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.file.default_expiration.is_zero() {
            return Err(CacheError::ConfigError(
                "default_expiration must be greater than 0".to_string(),
            ));
        }

        if self.memory.max_capacity == 0 {
            return Err(CacheError::ConfigError(
                "max_capacity must be greater than 0".to_string(),
            ));
        }

        if self.memory.flush_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "flush_interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.memory.flush_jitter) {
            return Err(CacheError::ConfigError(
                "flush_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.tier == CacheTier::Memory && self.memory.use_warm_loader {
            self.validate_blob()?;
        }

        Ok(())
    }

    fn validate_blob(&self) -> Result<()> {
        if self.blob.snapshot_name.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "snapshot_name must not be empty".to_string(),
            ));
        }

        match self.blob.backend {
            BlobBackendKind::Azure if self.blob.container_url.is_none() => {
                Err(CacheError::ConfigError(
                    "azure blob backend requires container_url".to_string(),
                ))
            }
            BlobBackendKind::Filesystem if self.blob.directory.is_none() => {
                Err(CacheError::ConfigError(
                    "filesystem blob backend requires a directory".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CacheError::ConfigError(format!(
            "{}{} is not a boolean: {}",
            ENV_PREFIX, name, other
        ))),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    parse_with::<u64>(name, value).map(Duration::from_secs)
}

fn parse_with<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        CacheError::ConfigError(format!("{}{} is invalid ({}): {}", ENV_PREFIX, name, value, e))
    })
}

/// Builder for cache settings
#[derive(Debug, Default)]
pub struct CacheSettingsBuilder {
    enabled: Option<bool>,
    tier: Option<CacheTier>,
    pretty_json: Option<bool>,
    directory: Option<PathBuf>,
    sweep_interval: Option<Duration>,
    default_expiration: Option<Duration>,
    restart_expiry: Option<RestartExpiry>,
    max_capacity: Option<u64>,
    use_warm_loader: Option<bool>,
    flush_interval: Option<Duration>,
    flush_initial_delay: Option<Duration>,
    flush_jitter: Option<f64>,
    blob: Option<BlobSettings>,
}

impl CacheSettingsBuilder {
    /// Enable or disable caching globally
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Select the tier backing the facade
    pub fn tier(mut self, tier: CacheTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn pretty_json(mut self, pretty: bool) -> Self {
        self.pretty_json = Some(pretty);
        self
    }

    /// Set the file tier directory
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Set the file tier sweep cadence
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the file tier default expiration
    pub fn default_expiration(mut self, ttl: Duration) -> Self {
        self.default_expiration = Some(ttl);
        self
    }

    pub fn restart_expiry(mut self, policy: RestartExpiry) -> Self {
        self.restart_expiry = Some(policy);
        self
    }

    /// Set the hot tier capacity
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    /// Enable or disable the warm snapshot loader
    pub fn use_warm_loader(mut self, enable: bool) -> Self {
        self.use_warm_loader = Some(enable);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn flush_initial_delay(mut self, delay: Duration) -> Self {
        self.flush_initial_delay = Some(delay);
        self
    }

    pub fn flush_jitter(mut self, jitter: f64) -> Self {
        self.flush_jitter = Some(jitter);
        self
    }

    /// Set warm snapshot storage
    pub fn blob(mut self, blob: BlobSettings) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Build the settings
    pub fn build(self) -> CacheSettings {
        let defaults = CacheSettings::default();

        CacheSettings {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            tier: self.tier.unwrap_or(defaults.tier),
            json: JsonOptions {
                pretty: self.pretty_json.unwrap_or(defaults.json.pretty),
            },
            file: FileCacheSettings {
                directory: self.directory.or(defaults.file.directory),
                sweep_interval: self.sweep_interval.unwrap_or(defaults.file.sweep_interval),
                default_expiration: self
                    .default_expiration
                    .unwrap_or(defaults.file.default_expiration),
                restart_expiry: self.restart_expiry.unwrap_or(defaults.file.restart_expiry),
            },
            memory: MemoryCacheSettings {
                max_capacity: self.max_capacity.unwrap_or(defaults.memory.max_capacity),
                use_warm_loader: self
                    .use_warm_loader
                    .unwrap_or(defaults.memory.use_warm_loader),
                flush_interval: self.flush_interval.unwrap_or(defaults.memory.flush_interval),
                flush_initial_delay: self
                    .flush_initial_delay
                    .unwrap_or(defaults.memory.flush_initial_delay),
                flush_jitter: self.flush_jitter.unwrap_or(defaults.memory.flush_jitter),
            },
            blob: self.blob.unwrap_or(defaults.blob),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.tier, CacheTier::Memory);
        assert_eq!(settings.file.sweep_interval, Duration::from_secs(60));
        assert_eq!(settings.file.default_expiration, Duration::from_secs(86_400));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let settings = CacheSettings::builder()
            .tier(CacheTier::File)
            .directory("/var/cache/faultline")
            .sweep_interval(Duration::from_secs(5))
            .restart_expiry(RestartExpiry::FromScanTime)
            .build();

        assert_eq!(settings.tier, CacheTier::File);
        assert_eq!(settings.file.sweep_interval, Duration::from_secs(5));
        assert_eq!(settings.file.restart_expiry, RestartExpiry::FromScanTime);
        assert_eq!(
            settings.file.resolve_directory().unwrap(),
            PathBuf::from("/var/cache/faultline")
        );
    }

    #[test]
    fn test_relative_directory_resolves_under_temp() {
        let settings = CacheSettings::builder().directory("faultline-test").build();
        let dir = settings.file.resolve_directory().unwrap();
        assert_eq!(dir, std::env::temp_dir().join("faultline-test"));
    }

    #[test]
    fn test_empty_directory_is_rejected() {
        let settings = CacheSettings::builder().directory("").build();
        assert!(matches!(
            settings.file.resolve_directory(),
            Err(CacheError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validation() {
        let invalid = CacheSettings::builder()
            .sweep_interval(Duration::ZERO)
            .build();
        assert!(invalid.validate().is_err());

        let invalid = CacheSettings::builder().flush_jitter(1.5).build();
        assert!(invalid.validate().is_err());

        let missing_container = CacheSettings::builder().use_warm_loader(true).build();
        assert!(missing_container.validate().is_err());

        let file_tier_ignores_blob = CacheSettings::builder()
            .tier(CacheTier::File)
            .use_warm_loader(true)
            .build();
        assert!(file_tier_ignores_blob.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let settings = CacheSettings::from_lookup(lookup(&[
            ("ENABLED", "false"),
            ("TIER", "file"),
            ("DIRECTORY", "/data/cache"),
            ("SWEEP_INTERVAL_SECS", "15"),
            ("RESTART_EXPIRY", "scan"),
            ("BLOB_BACKEND", "filesystem"),
            ("BLOB_PREFIX", "warm"),
        ]))
        .unwrap();

        assert!(!settings.enabled);
        assert_eq!(settings.tier, CacheTier::File);
        assert_eq!(settings.file.directory, Some(PathBuf::from("/data/cache")));
        assert_eq!(settings.file.sweep_interval, Duration::from_secs(15));
        assert_eq!(settings.file.restart_expiry, RestartExpiry::FromScanTime);
        assert_eq!(settings.blob.backend, BlobBackendKind::Filesystem);
        assert_eq!(settings.blob.prefix, "warm");
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = CacheSettings::from_lookup(lookup(&[("ENABLED", "maybe")]));
        assert!(matches!(result, Err(CacheError::ConfigError(_))));

        let result = CacheSettings::from_lookup(lookup(&[("SWEEP_INTERVAL_SECS", "-1")]));
        assert!(result.is_err());

        let result = CacheSettings::from_lookup(lookup(&[
            ("USE_WARM_LOADER", "true"),
            ("BLOB_BACKEND", "filesystem"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_flush_interval_with_jitter() {
        let memory = MemoryCacheSettings {
            flush_interval: Duration::from_secs(300),
            flush_jitter: 0.1,
            ..Default::default()
        };

        let interval = memory.flush_interval_with_jitter();
        assert!(interval.as_secs_f64() >= 270.0);
        assert!(interval.as_secs_f64() <= 330.0);

        let fixed = MemoryCacheSettings {
            flush_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(fixed.flush_interval_with_jitter(), fixed.flush_interval);
    }

    #[test]
    fn test_settings_deserialize_durations_as_seconds() {
        let json = r#"{
            "enabled": true,
            "tier": "file",
            "file": {
                "directory": "/tmp/c",
                "sweep_interval": 30,
                "default_expiration": 3600,
                "restart_expiry": "from_scan_time"
            }
        }"#;
        let settings: CacheSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.file.sweep_interval, Duration::from_secs(30));
        assert_eq!(settings.memory, MemoryCacheSettings::default());
    }
}
