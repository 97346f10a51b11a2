//! Batched HTTP log shipping.
//!
//! # Responsibilities
//! - Buffer events off the logging thread
//! - Post batches to Seq, a generic HTTP collector or the telemetry service
//! - Drain the buffer on close, within a deadline
//!
//! # Design Decisions
//! - The shipping task runs without a subscriber; its own HTTP client
//!   events must never feed back into the sinks
//! - The queue is bounded; events past the limit are dropped
//! - Delivery failures are counted, never raised

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::subscriber::NoSubscriber;
use url::Url;

use crate::observability::logging::LoggerInitError;
use crate::observability::sink::{LogEvent, LogLevel, LogSink};

/// Telemetry ingestion endpoint.
pub const TELEMETRY_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";
const CLEF_CONTENT_TYPE: &str = "application/vnd.serilog.clef";
const BATCH_LIMIT: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const SHIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue and shutdown bounds shared by every remote sink of a logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingLimits {
    /// Events buffered before new ones are dropped.
    pub queue_limit: usize,
    /// Longest `close_and_flush` waits for the backlog to ship.
    pub flush_deadline: Duration,
}

impl Default for ShippingLimits {
    fn default() -> Self {
        Self {
            queue_limit: 100_000,
            flush_deadline: Duration::from_secs(10),
        }
    }
}

/// Wire format of a remote sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFormat {
    /// Compact JSON lines for Seq's raw ingestion API.
    Seq,
    /// JSON array of events.
    Http,
    /// Trace envelopes for the telemetry service.
    Telemetry { instrumentation_key: String },
}

/// Sink that ships batches of events over HTTP from a background task.
pub struct RemoteSink {
    name: &'static str,
    endpoint: Url,
    tx: Mutex<Option<mpsc::Sender<LogEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flush_deadline: Duration,
    // Accepted into the queue but not yet shipped or counted as dropped.
    pending: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl RemoteSink {
    /// Seq server at `server_url`; events go to `/api/events/raw?clef`.
    pub fn seq(server_url: &str, limits: ShippingLimits) -> Result<Self, LoggerInitError> {
        let mut base = parse_endpoint(server_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut endpoint = base.join("api/events/raw").map_err(|source| LoggerInitError::InvalidEndpoint {
            url: server_url.to_string(),
            source,
        })?;
        endpoint.set_query(Some("clef"));
        Self::spawn("seq", endpoint, RemoteFormat::Seq, limits)
    }

    /// Generic HTTP collector accepting a JSON array at `request_uri`.
    pub fn http(request_uri: &str, limits: ShippingLimits) -> Result<Self, LoggerInitError> {
        Self::spawn("http", parse_endpoint(request_uri)?, RemoteFormat::Http, limits)
    }

    /// Telemetry sink posting to `endpoint`.
    pub fn telemetry(
        endpoint: &str,
        instrumentation_key: &str,
        limits: ShippingLimits,
    ) -> Result<Self, LoggerInitError> {
        Self::spawn(
            "telemetry",
            parse_endpoint(endpoint)?,
            RemoteFormat::Telemetry {
                instrumentation_key: instrumentation_key.to_string(),
            },
            limits,
        )
    }

    fn spawn(
        name: &'static str,
        endpoint: Url,
        format: RemoteFormat,
        limits: ShippingLimits,
    ) -> Result<Self, LoggerInitError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LoggerInitError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(limits.queue_limit.max(1));
        let pending = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let shipper = Shipper {
            client: reqwest::Client::new(),
            endpoint: endpoint.clone(),
            format,
            pending: Arc::clone(&pending),
            dropped: Arc::clone(&dropped),
        };
        let worker = runtime.spawn(shipper.run(rx).with_subscriber(NoSubscriber::default()));

        Ok(Self {
            name,
            endpoint,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            flush_deadline: limits.flush_deadline,
            pending,
            dropped,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl LogSink for RemoteSink {
    fn name(&self) -> &str {
        self.name
    }

    fn emit(&self, event: &LogEvent) {
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let queued = tx
            .as_ref()
            .map(|tx| tx.try_send(event.clone()).is_ok())
            .unwrap_or(false);
        if queued {
            self.pending.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn close_and_flush(&self) {
        // Dropping the sender lets the worker ship what is left and exit.
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        drop(tx);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut worker) = worker else {
            return;
        };
        if tokio::time::timeout(self.flush_deadline, &mut worker).await.is_err() {
            worker.abort();
            let abandoned = self.pending.swap(0, Ordering::Relaxed);
            self.dropped.fetch_add(abandoned, Ordering::Relaxed);
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn parse_endpoint(url: &str) -> Result<Url, LoggerInitError> {
    Url::parse(url.trim()).map_err(|source| LoggerInitError::InvalidEndpoint {
        url: url.to_string(),
        source,
    })
}

struct Shipper {
    client: reqwest::Client,
    endpoint: Url,
    format: RemoteFormat,
    pending: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Shipper {
    async fn run(self, mut rx: mpsc::Receiver<LogEvent>) {
        let mut batch = Vec::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= BATCH_LIMIT {
                            self.ship(&mut batch).await;
                        }
                    }
                    None => {
                        self.ship(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => self.ship(&mut batch).await,
            }
        }
    }

    async fn ship(&self, batch: &mut Vec<LogEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        let request = self.client.post(self.endpoint.clone()).timeout(SHIP_TIMEOUT);
        let request = match &self.format {
            RemoteFormat::Seq => request
                .header(CONTENT_TYPE, CLEF_CONTENT_TYPE)
                .body(clef_body(&events)),
            RemoteFormat::Http => request.json(&events),
            RemoteFormat::Telemetry { instrumentation_key } => {
                request.json(&telemetry_envelopes(instrumentation_key, &events))
            }
        };

        let delivered = matches!(request.send().await, Ok(response) if response.status().is_success());
        let count = events.len() as u64;
        self.pending.fetch_sub(count, Ordering::Relaxed);
        if !delivered {
            self.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }
}

/// Newline-delimited compact JSON (`@t`, `@l`, `@mt`, properties).
pub fn clef_body(events: &[LogEvent]) -> String {
    let mut body = String::new();
    for event in events {
        let mut line = Map::new();
        line.insert("@t".into(), Value::String(event.timestamp.to_rfc3339()));
        line.insert("@l".into(), Value::String(event.level.as_str().into()));
        line.insert("@mt".into(), Value::String(event.message.clone()));
        if let Some(error) = event.field("error") {
            line.insert("@x".into(), error.clone());
        }
        for (key, value) in &event.fields {
            // Leading `@` is reserved by the format.
            let key = if key.starts_with('@') { format!("@{key}") } else { key.clone() };
            line.insert(key, value.clone());
        }
        body.push_str(&Value::Object(line).to_string());
        body.push('\n');
    }
    body
}

fn telemetry_severity(level: LogLevel) -> u8 {
    match level {
        LogLevel::Verbose | LogLevel::Debug => 0,
        LogLevel::Information => 1,
        LogLevel::Warning => 2,
        LogLevel::Error => 3,
        LogLevel::Fatal => 4,
    }
}

/// One `MessageData` envelope per event.
pub fn telemetry_envelopes(instrumentation_key: &str, events: &[LogEvent]) -> Vec<Value> {
    let name = format!(
        "Microsoft.ApplicationInsights.{}.Message",
        instrumentation_key.replace('-', "")
    );
    events
        .iter()
        .map(|event| {
            let properties: Map<String, Value> = event
                .fields
                .iter()
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), Value::String(text))
                })
                .collect();
            json!({
                "name": name,
                "time": event.timestamp.to_rfc3339(),
                "iKey": instrumentation_key,
                "data": {
                    "baseType": "MessageData",
                    "baseData": {
                        "ver": 2,
                        "message": event.message,
                        "severityLevel": telemetry_severity(event.level),
                        "properties": properties,
                    }
                }
            })
        })
        .collect()
}
