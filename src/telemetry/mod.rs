//! Logging setup and log-event publishers
//!
//! Components log through `tracing`. [`init_tracing`] installs the console
//! subscriber; [`init_tracing_with_publishers`] additionally routes events
//! through a [`PublishingQueue`] to any set of [`LogPublisher`]s.

pub mod event;
pub mod layer;
pub mod publisher;
pub mod queue;

pub use event::{LogEvent, LogLevel};
pub use layer::PublisherLayer;
pub use publisher::{ConsolePublisher, EventSourcePublisher, LogPublisher};
pub use queue::{PublishingQueue, QueueHandle, QueueStats, DEFAULT_QUEUE_CAPACITY};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Calling it twice is harmless.
pub fn init_tracing(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Like [`init_tracing`], also forwarding events at `min_level` and above to
/// `publishers`. The returned queue must be shut down to flush them.
///
/// Must be called inside a tokio runtime.
pub fn init_tracing_with_publishers(
    default_directive: &str,
    min_level: LogLevel,
    publishers: Vec<Arc<dyn LogPublisher>>,
) -> PublishingQueue {
    let queue = PublishingQueue::start(DEFAULT_QUEUE_CAPACITY, publishers);
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .with(PublisherLayer::new(queue.handle(), min_level))
        .try_init();
    queue
}
