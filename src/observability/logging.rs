//! Logger construction.
//!
//! # Responsibilities
//! - Build the subscriber from resolved configuration
//! - Register the console, telemetry, Seq and HTTP sinks plus any declared
//!   under `Serilog:WriteTo`
//! - Flush every sink on close
//!
//! # Design Decisions
//! - Source-level minimum is Verbose unless `Serilog:MinimumLevel` says
//!   otherwise; sinks decide what they keep
//! - The logger is a value, not a global: callers run work under its
//!   `Dispatch`, so several loggers can coexist in one process

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::Dispatch;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;

use crate::config::ResolvedConfiguration;
use crate::identity::ApplicationIdentity;
use crate::observability::settings::{LoggingSettings, SinkSpec};
use crate::observability::shipping::{RemoteSink, ShippingLimits, TELEMETRY_ENDPOINT};
use crate::observability::sink::{LogSink, SinkLayer};

/// Error type for logger construction.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("unknown log level {value:?} at {key}")]
    UnknownLevel { key: String, value: String },

    #[error("unknown sink {name:?} at {key}")]
    UnknownSink { key: String, name: String },

    #[error("sink at {key} is missing its {argument} argument")]
    MissingArgument { key: String, argument: &'static str },

    #[error("invalid sink endpoint {url:?}: {source}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("remote log sinks need a running Tokio runtime")]
    NoRuntime,
}

/// An initialized logger and the sinks it writes to.
pub struct Logger {
    identity: ApplicationIdentity,
    dispatch: Dispatch,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl Logger {
    pub fn identity(&self) -> ApplicationIdentity {
        self.identity
    }

    /// Dispatcher to run logged work under.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Events every sink failed to deliver so far.
    pub fn dropped_events(&self) -> u64 {
        self.sinks.iter().map(|sink| sink.dropped()).sum()
    }

    /// Flush and close every sink, in registration order.
    pub async fn close_and_flush(&self) {
        for sink in &self.sinks {
            sink.close_and_flush().await;
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("identity", &self.identity)
            .field("sinks", &self.sink_names())
            .finish()
    }
}

/// Builds a [`Logger`] from configuration.
#[derive(Clone)]
pub struct LoggerBuilder {
    identity: ApplicationIdentity,
    console: bool,
    telemetry_endpoint: String,
    shipping_limits: ShippingLimits,
    extra_sinks: Vec<Arc<dyn LogSink>>,
}

impl LoggerBuilder {
    pub fn new(identity: ApplicationIdentity) -> Self {
        Self {
            identity,
            console: true,
            telemetry_endpoint: TELEMETRY_ENDPOINT.to_string(),
            shipping_limits: ShippingLimits::default(),
            extra_sinks: Vec::new(),
        }
    }

    /// Write to stdout. On by default; a `Console` entry in `WriteTo`
    /// turns it back on.
    pub fn console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    pub fn telemetry_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.telemetry_endpoint = endpoint.into();
        self
    }

    /// Queue size and flush deadline for every remote sink.
    pub fn shipping_limits(mut self, limits: ShippingLimits) -> Self {
        self.shipping_limits = limits;
        self
    }

    /// Register an additional sink after the configured ones.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub fn build(&self, config: &ResolvedConfiguration) -> Result<Logger, LoggerInitError> {
        let settings = LoggingSettings::from_config(config)?;

        let limits = self.shipping_limits;
        let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
        if let Some(key) = &settings.instrumentation_key {
            sinks.push(Arc::new(RemoteSink::telemetry(&self.telemetry_endpoint, key, limits)?));
        }
        sinks.push(Arc::new(RemoteSink::seq(&settings.seq_server_url, limits)?));
        sinks.push(Arc::new(RemoteSink::http(&settings.logstash_url, limits)?));

        let mut console = self.console;
        for spec in &settings.write_to {
            match spec {
                SinkSpec::Console => console = true,
                SinkSpec::Seq { server_url } => sinks.push(Arc::new(RemoteSink::seq(server_url, limits)?)),
                SinkSpec::Http { request_uri } => {
                    sinks.push(Arc::new(RemoteSink::http(request_uri, limits)?))
                }
            }
        }
        sinks.extend(self.extra_sinks.iter().cloned());

        let mut filter = Targets::new().with_default(settings.minimum_level.level_filter());
        for (target, level) in &settings.overrides {
            filter = filter.with_target(target.clone(), level.level_filter());
        }

        let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_target(false).compact());
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(SinkLayer::new(self.identity, sinks.clone()));

        Ok(Logger {
            identity: self.identity,
            dispatch: Dispatch::new(subscriber),
            sinks,
        })
    }
}

/// Build a logger with the default sinks.
pub fn init_logger(
    config: &ResolvedConfiguration,
    identity: ApplicationIdentity,
) -> Result<Logger, LoggerInitError> {
    LoggerBuilder::new(identity).build(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::sink::MemorySink;

    const IDENTITY: ApplicationIdentity = ApplicationIdentity::new("Catalog.API");

    #[tokio::test]
    async fn registers_default_sinks() {
        let config = ResolvedConfiguration::default();
        let logger = LoggerBuilder::new(IDENTITY).console(false).build(&config).unwrap();
        assert_eq!(logger.sink_names(), vec!["seq", "http"]);
        logger.close_and_flush().await;
    }

    #[tokio::test]
    async fn instrumentation_key_adds_telemetry_sink() {
        let config = ResolvedConfiguration::from_pairs([
            ("APPINSIGHTS_INSTRUMENTATIONKEY", "key-1"),
            ("Serilog:WriteTo:0:Name", "Http"),
            ("Serilog:WriteTo:0:Args:requestUri", "http://collector"),
        ]);
        let logger = LoggerBuilder::new(IDENTITY).console(false).build(&config).unwrap();
        assert_eq!(logger.sink_names(), vec!["telemetry", "seq", "http", "http"]);
        logger.close_and_flush().await;
    }

    #[tokio::test]
    async fn minimum_level_filters_at_the_source() {
        let memory = Arc::new(MemorySink::new());
        let config = ResolvedConfiguration::from_pairs([("Serilog:MinimumLevel", "Warning")]);
        let logger = LoggerBuilder::new(IDENTITY)
            .console(false)
            .with_sink(memory.clone())
            .build(&config)
            .unwrap();

        tracing::dispatcher::with_default(logger.dispatch(), || {
            tracing::info!("dropped");
            tracing::warn!("kept");
        });
        logger.close_and_flush().await;

        let messages: Vec<String> = memory.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["kept".to_string()]);
        assert!(memory.is_closed());
    }

    #[tokio::test]
    async fn malformed_endpoint_fails() {
        let config = ResolvedConfiguration::from_pairs([("Serilog:LogstashUrl", "not a url")]);
        let err = LoggerBuilder::new(IDENTITY).console(false).build(&config).unwrap_err();
        assert!(matches!(err, LoggerInitError::InvalidEndpoint { .. }));
    }
}
