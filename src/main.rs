use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use faultline_core::cache::{
    CacheSettings, CacheTier, EntryOptions, FileCacheStore, JsonCodec, WarmCacheLoader,
};

#[derive(Parser)]
#[command(name = "faultline-cache")]
#[command(about = "Inspect and maintain the faultline cache tiers", long_about = None)]
struct Cli {
    /// Cache directory (overrides FAULTLINE_CACHE_DIRECTORY)
    #[arg(short, long)]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cached JSON value for a key
    Get {
        key: String,
    },

    /// Store a JSON value under a key
    Put {
        key: String,

        /// JSON text of the value
        json: String,

        /// Lifetime in seconds (default: the configured default expiration)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Delete a key
    Remove {
        key: String,
    },

    /// Delete every expired entry now
    Sweep,

    /// List tracked entries with their expiration
    List,

    /// Summarize the warm snapshot in blob storage
    SnapshotInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    faultline_core::telemetry::init_tracing("faultline_core=warn");

    let cli = Cli::parse();
    let mut settings = CacheSettings::from_env().context("invalid cache settings")?;
    if let Some(dir) = cli.directory {
        settings.file.directory = Some(dir);
    }
    let codec = Arc::new(JsonCodec::new(settings.json.clone()));

    if let Commands::SnapshotInfo = cli.command {
        return snapshot_info(&settings, codec).await;
    }

    settings.tier = CacheTier::File;
    let store = FileCacheStore::new(&settings, codec)
        .await
        .context("failed to open file cache")?;

    match cli.command {
        Commands::Get { key } => match store.try_get::<serde_json::Value>(&key).await {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => anyhow::bail!("no entry for '{}'", key),
        },

        Commands::Put { key, json, ttl_secs } => {
            let value: serde_json::Value =
                serde_json::from_str(&json).context("value is not valid JSON")?;
            let mut options = EntryOptions::new();
            if let Some(secs) = ttl_secs {
                options = options.expires_in(Duration::from_secs(secs));
            }
            store.create_entry(&key, &value, options).await;
            match store.index_entry(&key) {
                Some(entry) => println!("Stored {} (expires {})", key, entry.absolute_expiration),
                None => anyhow::bail!("entry for '{}' was not written", key),
            }
        }

        Commands::Remove { key } => {
            store.remove(&key).await;
            println!("Removed {}", key);
        }

        Commands::Sweep => {
            let removed = store.sweep_expired().await;
            println!("Removed {} expired entries", removed);
        }

        Commands::List => {
            let entries = store.list_entries();
            if entries.is_empty() {
                println!("No cache entries in {:?}", store.directory());
            }
            for entry in entries {
                println!(
                    "{}  created {}  expires {}",
                    entry.cache_item_path.display(),
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.absolute_expiration.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        // Served before the file store is opened
        Commands::SnapshotInfo => {}
    }

    store.shutdown().await;
    Ok(())
}

async fn snapshot_info(settings: &CacheSettings, codec: Arc<JsonCodec>) -> Result<()> {
    let loader = WarmCacheLoader::from_settings(&settings.blob, codec)
        .context("failed to configure blob storage")?;
    let decoded = loader.load().await.context("failed to load warm snapshot")?;

    println!("Snapshot: {}", loader.blob_name());
    println!("  Entries: {}", decoded.snapshot.len());
    println!("  Skipped: {}", decoded.skipped.len());
    println!("  Expired: {}", decoded.expired.len());
    for (kind, count) in decoded.snapshot.kind_counts() {
        println!("  {:<12} {}", kind, count);
    }
    Ok(())
}
