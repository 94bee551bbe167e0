//! Tracing layer forwarding events into a [`PublishingQueue`](super::PublishingQueue)

use crate::telemetry::event::{LogEvent, LogLevel};
use crate::telemetry::queue::QueueHandle;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Events from the publishing pipeline itself are never re-published
const SELF_TARGET: &str = "faultline_core::telemetry";

/// Converts `tracing` events into [`LogEvent`]s and enqueues them without blocking
pub struct PublisherLayer {
    queue: QueueHandle,
    min_level: LogLevel,
}

impl PublisherLayer {
    pub fn new(queue: QueueHandle, min_level: LogLevel) -> Self {
        Self { queue, min_level }
    }
}

impl<S> Layer<S> for PublisherLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let level = LogLevel::from(meta.level());
        if level < self.min_level || meta.target().starts_with(SELF_TARGET) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut log_event = LogEvent::new(level, meta.target(), visitor.message.unwrap_or_default());
        log_event.fields = visitor.fields;
        self.queue.enqueue(log_event);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.put(field, format!("{:?}", value));
    }
}
