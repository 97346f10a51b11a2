//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use catalog_host::config::{ConfigurationResolver, EnvironmentSource, ResolverOptions};
use catalog_host::migration::{BoxError, DataStore, Seeder, ServiceScope};
use catalog_host::observability::{LoggerBuilder, MemorySink};
use catalog_host::{ApplicationIdentity, BootstrapState};

pub const IDENTITY: ApplicationIdentity = ApplicationIdentity::new("Catalog.API");

/// Nothing listens here; remote sinks fail fast and count drops.
pub const DISCARD_URL: &str = "http://127.0.0.1:9";

/// A port that was free a moment ago on every interface.
pub fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port()
}

/// Write `settings` as `appsettings.json` under `dir`.
pub fn write_settings(dir: &Path, settings: &Value) {
    std::fs::write(dir.join("appsettings.json"), serde_json::to_vec_pretty(settings).unwrap()).unwrap();
}

/// Base settings with both listener ports and quiet remote sinks.
pub fn listener_settings(port: u16, grpc_port: u16) -> Value {
    json!({
        "PORT": port,
        "GRPC_PORT": grpc_port,
        "UseVault": false,
        "Serilog": {
            "SeqServerUrl": DISCARD_URL,
            "LogstashUrl": DISCARD_URL
        }
    })
}

/// Resolver over `dir` that ignores the process environment.
pub fn resolver(dir: &Path, env: &[(&str, &str)]) -> ConfigurationResolver {
    ConfigurationResolver::new(ResolverOptions::new(dir))
        .with_environment(EnvironmentSource::from_vars(env.iter().copied()))
}

/// Logger builder that also records into a memory sink.
pub fn memory_logger() -> (LoggerBuilder, Arc<MemorySink>) {
    let memory = Arc::new(MemorySink::new());
    let builder = LoggerBuilder::new(IDENTITY).console(false).with_sink(memory.clone());
    (builder, memory)
}

/// Wait until the sequencer reports `target`, or panic after five seconds.
pub async fn wait_for_state(mut state: watch::Receiver<BootstrapState>, target: BootstrapState) {
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|current| *current == target))
        .await
        .expect("timed out waiting for state")
        .expect("sequencer dropped");
}

/// Ordered record of store and seeder calls.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Store that journals `migrate:{target}` and optionally fails.
pub struct RecordingStore {
    journal: Journal,
    fail: bool,
}

impl RecordingStore {
    pub fn ok(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            fail: false,
        })
    }

    pub fn failing(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            fail: true,
        })
    }
}

#[async_trait]
impl DataStore for RecordingStore {
    async fn migrate(&self, scope: &ServiceScope) -> Result<(), BoxError> {
        self.journal.record(format!("migrate:{}", scope.target()));
        if self.fail {
            return Err(format!("schema migration for {} failed", scope.target()).into());
        }
        Ok(())
    }
}

/// Seeder that counts its calls and journals `seed:{target}`.
pub struct CountingSeeder {
    journal: Journal,
    calls: AtomicUsize,
}

impl CountingSeeder {
    pub fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Seeder for CountingSeeder {
    async fn seed(&self, scope: &ServiceScope) -> Result<(), BoxError> {
        // Yield first so a detached seed would be observable.
        tokio::task::yield_now().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("seed:{}", scope.target()));
        Ok(())
    }
}
