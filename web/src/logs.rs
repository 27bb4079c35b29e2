//! Live log-line capture for observers.
//!
//! [`LogBroadcastLayer`] is a `tracing_subscriber` layer that turns every
//! event into a [`LogLine`] and pushes it onto a `tokio::sync::broadcast`
//! channel. The broadcast hub subscribes to that channel.
//!
//! Events emitted by the hub itself are skipped; otherwise a failed write
//! would log a line, which would be broadcast, which could fail again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Default capacity of the log-line channel.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

const HUB_TARGET: &str = "healwatch_web::hub";

/// One captured log record.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// When the record was captured.
    pub timestamp: DateTime<Utc>,
    /// Level, upper case.
    pub level: String,
    /// Module path or explicit target.
    pub target: String,
    /// The `message` field.
    pub message: String,
    /// Every other structured field.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(format!("{value:?}")));
        }
    }
}

/// Layer that copies log records onto a broadcast channel.
#[derive(Clone, Debug)]
pub struct LogBroadcastLayer {
    sender: broadcast::Sender<LogLine>,
}

impl LogBroadcastLayer {
    /// Create a layer with a channel of `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A new receiver of captured lines.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.sender.subscribe()
    }
}

impl Default for LogBroadcastLayer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl<S: Subscriber> Layer<S> for LogBroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(HUB_TARGET) {
            return;
        }
        if self.sender.receiver_count() == 0 {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        // no receivers is not an error
        let _ = self.sender.send(LogLine {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: collector.message,
            fields: collector.fields,
        });
    }
}
