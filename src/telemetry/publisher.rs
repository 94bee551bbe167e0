//! Log publishers: console lines and an ETW-style structured sink

use crate::error::{CacheError, Result};
use crate::telemetry::event::{LogEvent, LogLevel};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

/// Destination for log events.
///
/// Publishers are driven from a single drain task, so implementations only
/// need interior mutability for their writer.
pub trait LogPublisher: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    fn publish(&self, event: &LogEvent) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// Writes one human-readable line per event
pub struct ConsolePublisher {
    min_level: LogLevel,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsolePublisher {
    /// Publisher writing to stdout
    pub fn stdout(min_level: LogLevel) -> Self {
        Self::with_writer(min_level, Box::new(std::io::stdout()))
    }

    pub fn with_writer(min_level: LogLevel, writer: Box<dyn Write + Send>) -> Self {
        Self {
            min_level,
            writer: Mutex::new(writer),
        }
    }

    fn format(event: &LogEvent) -> String {
        let mut line = format!(
            "{} {:>5} {}: {}",
            event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.level,
            event.target,
            event.message
        );
        for (name, value) in &event.fields {
            line.push_str(&format!(" {}={}", name, value));
        }
        line
    }
}

impl LogPublisher for ConsolePublisher {
    fn name(&self) -> &str {
        "console"
    }

    fn publish(&self, event: &LogEvent) -> Result<()> {
        if event.level < self.min_level {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CacheError::Other("console writer poisoned".to_string()))?;
        writeln!(writer, "{}", Self::format(event))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CacheError::Other("console writer poisoned".to_string()))?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct EventSourceRecord<'a> {
    provider: &'a str,
    event_id: u16,
    level: &'static str,
    timestamp: String,
    activity_id: String,
    target: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "no_fields")]
    payload: &'a BTreeMap<String, String>,
}

fn no_fields(fields: &&BTreeMap<String, String>) -> bool {
    fields.is_empty()
}

/// Structured sink writing one JSON record per event, shaped after an event
/// source provider: provider name, numeric event id from the level, level
/// keyword and the payload fields
pub struct EventSourcePublisher {
    provider: String,
    min_level: LogLevel,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl EventSourcePublisher {
    pub fn new(provider: impl Into<String>, min_level: LogLevel, writer: Box<dyn Write + Send>) -> Self {
        Self {
            provider: provider.into(),
            min_level,
            writer: Mutex::new(writer),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn record<'a>(&'a self, event: &'a LogEvent) -> EventSourceRecord<'a> {
        EventSourceRecord {
            provider: &self.provider,
            event_id: event.level.event_id(),
            level: event.level.keyword(),
            timestamp: event.timestamp.to_rfc3339(),
            activity_id: event.id.to_string(),
            target: &event.target,
            message: &event.message,
            payload: &event.fields,
        }
    }
}

impl LogPublisher for EventSourcePublisher {
    fn name(&self) -> &str {
        &self.provider
    }

    fn publish(&self, event: &LogEvent) -> Result<()> {
        if event.level < self.min_level {
            return Ok(());
        }
        let line = serde_json::to_string(&self.record(event))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CacheError::Other("event source writer poisoned".to_string()))?;
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CacheError::Other("event source writer poisoned".to_string()))?;
        writer.flush()?;
        Ok(())
    }
}
