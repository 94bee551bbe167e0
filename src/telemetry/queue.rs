//! Bounded publishing queue drained by one supervised background task

use crate::telemetry::event::LogEvent;
use crate::telemetry::publisher::LogPublisher;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of events buffered before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    publish_errors: AtomicU64,
}

/// Counters of a [`PublishingQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,

    /// Events handed to every publisher
    pub published: u64,

    /// Events rejected because the queue was full or closed
    pub dropped: u64,

    /// Individual publisher failures
    pub publish_errors: u64,
}

/// Cheap, cloneable sending side of a [`PublishingQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<LogEvent>,
    counters: Arc<QueueCounters>,
}

impl QueueHandle {
    /// Enqueue without waiting; returns false when the event was dropped
    pub fn enqueue(&self, event: LogEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Fans log events out to a fixed set of publishers.
///
/// Producers never block: a full queue drops the event and counts it.
/// Publisher failures are counted and never reach the producer. On
/// [`shutdown`](Self::shutdown) the queue stops accepting events, drains what
/// is buffered and flushes every publisher.
pub struct PublishingQueue {
    handle: QueueHandle,
    shutdown: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl PublishingQueue {
    /// Start the drain task; must be called inside a tokio runtime
    pub fn start(capacity: usize, publishers: Vec<Arc<dyn LogPublisher>>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(QueueCounters::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_drain(
            receiver,
            publishers,
            Arc::clone(&counters),
            shutdown.clone(),
        ));

        Self {
            handle: QueueHandle { sender, counters },
            shutdown,
            drain: Mutex::new(Some(handle)),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, event: LogEvent) -> bool {
        self.handle.enqueue(event)
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.handle.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
        }
    }

    /// Drain buffered events, flush publishers and stop the task
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.drain.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PublishingQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn dispatch(event: &LogEvent, publishers: &[Arc<dyn LogPublisher>], counters: &QueueCounters) {
    for publisher in publishers {
        if publisher.publish(event).is_err() {
            counters.publish_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    counters.published.fetch_add(1, Ordering::Relaxed);
}

async fn run_drain(
    mut receiver: mpsc::Receiver<LogEvent>,
    publishers: Vec<Arc<dyn LogPublisher>>,
    counters: Arc<QueueCounters>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => dispatch(&event, &publishers, &counters),
                None => break,
            },
        }
    }

    // Refuse new events, then publish whatever is already buffered
    receiver.close();
    while let Some(event) = receiver.recv().await {
        dispatch(&event, &publishers, &counters);
    }

    for publisher in &publishers {
        if publisher.flush().is_err() {
            counters.publish_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("Log publishing queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Result};
    use crate::telemetry::event::LogLevel;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recording {
        messages: StdMutex<Vec<String>>,
        flushed: AtomicU64,
    }

    impl LogPublisher for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn publish(&self, event: &LogEvent) -> Result<()> {
            self.messages.lock().unwrap().push(event.message.clone());
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            self.flushed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Failing;

    impl LogPublisher for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn publish(&self, _event: &LogEvent) -> Result<()> {
            Err(CacheError::Other("sink offline".to_string()))
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_reach_every_publisher() {
        let recording = Arc::new(Recording::default());
        let queue = PublishingQueue::start(16, vec![recording.clone(), Arc::new(Failing)]);

        for i in 0..5 {
            assert!(queue.enqueue(LogEvent::new(LogLevel::Info, "t", format!("m{}", i))));
        }
        queue.shutdown().await;

        assert_eq!(
            *recording.messages.lock().unwrap(),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
        assert_eq!(recording.flushed.load(Ordering::Relaxed), 1);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.published, 5);
        assert_eq!(stats.publish_errors, 5);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_dropped() {
        let queue = PublishingQueue::start(4, vec![Arc::new(Recording::default())]);
        queue.shutdown().await;

        assert!(!queue.enqueue(LogEvent::new(LogLevel::Info, "t", "late")));
        assert_eq!(queue.stats().dropped, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops() {
        let recording = Arc::new(Recording::default());
        let queue = PublishingQueue::start(2, vec![recording.clone()]);

        // The drain task cannot run until this task yields
        let accepted = (0..5)
            .filter(|i| queue.enqueue(LogEvent::new(LogLevel::Info, "t", format!("m{}", i))))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(queue.stats().dropped, 3);

        queue.shutdown().await;
        assert_eq!(recording.messages.lock().unwrap().len(), 2);
    }
}
