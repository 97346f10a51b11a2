//! Log events and the sinks that receive them.
//!
//! # Responsibilities
//! - Turn each `tracing` event into a [`LogEvent`]
//! - Copy enclosing span fields into the event (ambient context)
//! - Tag every event with `ApplicationContext`
//! - Fan the event out to every registered [`LogSink`]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::identity::ApplicationIdentity;

/// Enrichment property carried by every event.
pub const APPLICATION_CONTEXT: &str = "ApplicationContext";
/// Boolean event field that promotes an error event to [`LogLevel::Fatal`].
pub const FATAL_FIELD: &str = "fatal";

/// Severity as reported to sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LogLevel {
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Case-insensitive level name.
    pub fn parse(name: &str) -> Option<Self> {
        let level = match name.trim().to_ascii_lowercase().as_str() {
            "verbose" => Self::Verbose,
            "debug" => Self::Debug,
            "information" => Self::Information,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "fatal" => Self::Fatal,
            _ => return None,
        };
        Some(level)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        }
    }

    /// Most verbose `tracing` filter that still admits this level.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Verbose => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Information => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            Self::Error | Self::Fatal => LevelFilter::ERROR,
        }
    }

    fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::TRACE => Self::Verbose,
            Level::DEBUG => Self::Debug,
            Level::INFO => Self::Information,
            Level::WARN => Self::Warning,
            Level::ERROR => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, Value>,
}

impl LogEvent {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

/// Destination for log events.
///
/// `emit` is called on the logging thread and must not block; sinks that
/// do I/O hand the event to a background task.
#[async_trait]
pub trait LogSink: Send + Sync {
    fn name(&self) -> &str;

    fn emit(&self, event: &LogEvent);

    /// Deliver everything buffered and release the sink.
    async fn close_and_flush(&self) {}

    /// Events that could not be delivered.
    fn dropped(&self) -> u64 {
        0
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.message = Some(text);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Span extension holding the span's recorded fields.
struct SpanFields(BTreeMap<String, Value>);

/// `tracing` layer that forwards events to [`LogSink`]s.
pub struct SinkLayer {
    identity: ApplicationIdentity,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl SinkLayer {
    pub fn new(identity: ApplicationIdentity, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { identity, sinks }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(visitor.fields),
            None => extensions.insert(SpanFields(visitor.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.0.clone());
                }
            }
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        fields.extend(visitor.fields);

        let metadata = event.metadata();
        let level = match fields.remove(FATAL_FIELD) {
            Some(Value::Bool(true)) => LogLevel::Fatal,
            _ => LogLevel::from_tracing(metadata.level()),
        };
        fields.insert(
            APPLICATION_CONTEXT.to_string(),
            Value::String(self.identity.as_str().to_string()),
        );

        let record = LogEvent {
            timestamp: Utc::now(),
            level,
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
        };
        for sink in &self.sinks {
            sink.emit(&record);
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.lock().clone()
    }

    pub fn fatal_events(&self) -> Vec<LogEvent> {
        self.lock()
            .iter()
            .filter(|event| event.level == LogLevel::Fatal)
            .cloned()
            .collect()
    }

    /// Whether `close_and_flush` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, event: &LogEvent) {
        self.lock().push(event.clone());
    }

    async fn close_and_flush(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
