//! In-memory capture of recent log events, served by the gate's log endpoint

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tracing::{Level, Subscriber};
use tracing_subscriber::Layer;

static GLOBAL_LOG_BUFFER: OnceLock<Arc<LogBuffer>> = OnceLock::new();

/// One captured log event
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

/// Bounded ring of log entries
#[derive(Debug)]
pub struct LogBuffer {
    entries: RwLock<VecDeque<LogEntry>>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_size.min(4096))),
            max_size: max_size.max(1),
        }
    }

    pub fn add_entry(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.max_size {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Most recent entries first, optionally filtered by level and a case-insensitive search
    pub fn get_filtered_entries(
        &self,
        limit: usize,
        level_filter: Option<&str>,
        search_term: Option<&str>,
    ) -> Vec<LogEntry> {
        let search = search_term.map(str::to_lowercase);
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|entry| level_filter.map_or(true, |level| entry.level.eq_ignore_ascii_case(level)))
            .filter(|entry| {
                search.as_ref().map_or(true, |s| {
                    entry.message.to_lowercase().contains(s) || entry.target.to_lowercase().contains(s)
                })
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Tracing layer that copies every event into a [`LogBuffer`]
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };

        let mut message = String::new();
        let mut fields = serde_json::Map::new();
        event.record(&mut LogVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        self.buffer.add_entry(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: metadata.target().to_string(),
            message,
            fields: if fields.is_empty() {
                None
            } else {
                Some(Value::Object(fields))
            },
        });
    }
}

struct LogVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut serde_json::Map<String, Value>,
}

impl<'a> tracing::field::Visit for LogVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}

/// Install the process-wide buffer; a second call returns the existing one
pub fn initialize_global_log_buffer(max_size: usize) -> Arc<LogBuffer> {
    GLOBAL_LOG_BUFFER
        .get_or_init(|| Arc::new(LogBuffer::new(max_size)))
        .clone()
}

pub fn get_global_log_buffer() -> Option<Arc<LogBuffer>> {
    GLOBAL_LOG_BUFFER.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: "agentgate::supervisor".to_string(),
            message: message.to_string(),
            fields: None,
        }
    }

    #[test]
    fn test_buffer_is_bounded() {
        let buffer = LogBuffer::new(2);
        buffer.add_entry(entry("info", "one"));
        buffer.add_entry(entry("info", "two"));
        buffer.add_entry(entry("info", "three"));
        assert_eq!(buffer.len(), 2);

        let recent = buffer.get_filtered_entries(10, None, None);
        assert_eq!(recent[0].message, "three");
        assert_eq!(recent[1].message, "two");
    }

    #[test]
    fn test_filters() {
        let buffer = LogBuffer::new(10);
        buffer.add_entry(entry("info", "Backend ready on port 4096"));
        buffer.add_entry(entry("warn", "[backend] something odd"));

        assert_eq!(buffer.get_filtered_entries(10, Some("WARN"), None).len(), 1);
        assert_eq!(buffer.get_filtered_entries(10, None, Some("PORT 4096")).len(), 1);
        assert_eq!(buffer.get_filtered_entries(10, None, Some("supervisor")).len(), 2);
        assert_eq!(buffer.get_filtered_entries(1, None, None).len(), 1);
    }
}
