//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve configuration, then build the logger from it
//! - Build the host, apply migrations, then bind and serve
//! - Report any failure after the logger exists as one fatal event
//! - Flush the logger on every exit path
//!
//! # Design Decisions
//! - Fail fast: any phase error ends the run, nothing is retried
//! - Phases run strictly in order; listeners bind only after migrations
//! - Failures before the logger exists surface only through the outcome

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::sync::watch;
use tracing::instrument::WithSubscriber;

use crate::config::{ConfigError, ConfigurationResolver, ResolvedConfiguration, SecretStoreError};
use crate::http::{HostBuilder, HostError};
use crate::identity::ApplicationIdentity;
use crate::migration::{apply_migrations, MigrationError, MigrationTarget};
use crate::observability::{Logger, LoggerBuilder, LoggerInitError};

/// Where the sequencer is in the startup pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Init,
    ConfigLoaded,
    LoggerReady,
    HostBuilt,
    Migrated,
    Listening,
    /// Absorbing; no phase runs after this.
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::ConfigLoaded => "ConfigLoaded",
            Self::LoggerReady => "LoggerReady",
            Self::HostBuilt => "HostBuilt",
            Self::Migrated => "Migrated",
            Self::Listening => "Listening",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Error type for a failed startup or serve.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration could not be loaded: {0}")]
    ConfigLoad(#[source] ConfigError),

    #[error("secret store failed: {0}")]
    SecretStore(#[source] SecretStoreError),

    #[error("logger could not be initialized: {0}")]
    LoggerInit(#[source] LoggerInitError),

    #[error("host could not be built: {0}")]
    HostBuild(#[source] HostError),

    #[error("migration failed: {0}")]
    Migration(#[source] MigrationError),

    #[error("listener could not be bound: {0}")]
    ListenerBind(#[source] HostError),

    #[error("host terminated unexpectedly: {0}")]
    UnhandledRuntime(#[source] HostError),
}

impl BootstrapError {
    /// State the sequencer was in when the error was raised.
    pub fn state(&self) -> BootstrapState {
        match self {
            Self::ConfigLoad(_) | Self::SecretStore(_) => BootstrapState::Init,
            Self::LoggerInit(_) => BootstrapState::ConfigLoaded,
            Self::HostBuild(_) => BootstrapState::LoggerReady,
            Self::Migration(_) => BootstrapState::HostBuilt,
            Self::ListenerBind(_) => BootstrapState::Migrated,
            Self::UnhandledRuntime(_) => BootstrapState::Listening,
        }
    }

    /// Whether a logger existed when the error was raised.
    pub fn is_logged(&self) -> bool {
        !matches!(
            self.state(),
            BootstrapState::Init | BootstrapState::ConfigLoaded
        )
    }
}

impl From<ConfigError> for BootstrapError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::SecretStore(e) => Self::SecretStore(e),
            other => Self::ConfigLoad(other),
        }
    }
}

/// Result of a complete run.
#[derive(Debug)]
pub enum BootstrapOutcome {
    Success,
    Failure(BootstrapError),
}

impl BootstrapOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// `0` after a clean shutdown, `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure(_) => 1,
        }
    }
}

impl From<BootstrapOutcome> for ExitCode {
    fn from(outcome: BootstrapOutcome) -> Self {
        ExitCode::from(outcome.exit_code())
    }
}

type MigrationRegistry = Box<dyn FnOnce(&ResolvedConfiguration) -> Vec<MigrationTarget> + Send>;

/// The startup sequencer.
pub struct Bootstrap {
    identity: ApplicationIdentity,
    resolver: ConfigurationResolver,
    router: Router,
    logger_builder: LoggerBuilder,
    migrations: Option<MigrationRegistry>,
    web_root_mount: Option<String>,
    bind_address: IpAddr,
    state: watch::Sender<BootstrapState>,
}

impl Bootstrap {
    pub fn new(identity: ApplicationIdentity, resolver: ConfigurationResolver, router: Router) -> Self {
        let (state, _) = watch::channel(BootstrapState::Init);
        Self {
            identity,
            resolver,
            router,
            logger_builder: LoggerBuilder::new(identity),
            migrations: None,
            web_root_mount: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            state,
        }
    }

    /// Replace the default logger builder, e.g. to add sinks.
    pub fn logger_builder(mut self, builder: LoggerBuilder) -> Self {
        self.logger_builder = builder;
        self
    }

    /// Register migration targets once configuration is known. Targets run
    /// in the order returned.
    pub fn with_migrations<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&ResolvedConfiguration) -> Vec<MigrationTarget> + Send + 'static,
    {
        self.migrations = Some(Box::new(register));
        self
    }

    /// Serve the host's web root under `mount`.
    pub fn serve_web_root(mut self, mount: impl Into<String>) -> Self {
        self.web_root_mount = Some(mount.into());
        self
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Watch state transitions.
    pub fn state(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    /// Run every phase, then serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> BootstrapOutcome
    where
        F: Future<Output = ()> + Send,
    {
        let Bootstrap {
            identity,
            resolver,
            router,
            logger_builder,
            migrations,
            web_root_mount,
            bind_address,
            state,
        } = self;

        let config = match resolver.resolve().await {
            Ok(config) => Arc::new(config),
            Err(err) => return fail(&state, err.into()),
        };
        state.send_replace(BootstrapState::ConfigLoaded);

        let logger = match logger_builder.build(&config) {
            Ok(logger) => logger,
            Err(err) => return fail(&state, BootstrapError::LoggerInit(err)),
        };
        state.send_replace(BootstrapState::LoggerReady);

        let phases = Phases {
            identity,
            config,
            router,
            content_root: resolver.options().content_root.clone(),
            bind_address,
            migrations,
            web_root_mount,
            state: &state,
            logger: &logger,
        };
        let result = phases
            .run(shutdown)
            .with_subscriber(logger.dispatch().clone())
            .await;

        let outcome = match result {
            Ok(()) => BootstrapOutcome::Success,
            Err(err) => {
                report_fatal(&logger, &err);
                fail(&state, err)
            }
        };
        logger.close_and_flush().await;
        outcome
    }
}

/// Everything the logged phases need.
struct Phases<'a> {
    identity: ApplicationIdentity,
    config: Arc<ResolvedConfiguration>,
    router: Router,
    content_root: std::path::PathBuf,
    bind_address: IpAddr,
    migrations: Option<MigrationRegistry>,
    web_root_mount: Option<String>,
    state: &'a watch::Sender<BootstrapState>,
    logger: &'a Logger,
}

impl Phases<'_> {
    async fn run<F>(self, shutdown: F) -> Result<(), BootstrapError>
    where
        F: Future<Output = ()> + Send,
    {
        let identity = self.identity;

        tracing::info!("Configuring web host ({identity})...");
        let mut builder = HostBuilder::new(self.router);
        if let Some(mount) = self.web_root_mount {
            builder = builder.serve_web_root(mount);
        }
        let host = builder
            .use_configuration(Arc::clone(&self.config))
            .content_root(self.content_root)
            .bind_address(self.bind_address)
            .capture_startup_errors(false)
            .use_logger(self.logger)
            .build()
            .map_err(BootstrapError::HostBuild)?;
        self.state.send_replace(BootstrapState::HostBuilt);

        tracing::info!("Applying migrations ({identity})...");
        let targets = self.migrations.map(|register| register(&self.config)).unwrap_or_default();
        apply_migrations(&host, &targets)
            .await
            .map_err(BootstrapError::Migration)?;
        self.state.send_replace(BootstrapState::Migrated);

        tracing::info!("Starting web host ({identity})...");
        let bound = host.bind().await.map_err(BootstrapError::ListenerBind)?;
        self.state.send_replace(BootstrapState::Listening);

        bound
            .serve(shutdown)
            .await
            .map_err(BootstrapError::UnhandledRuntime)
    }
}

fn report_fatal(logger: &Logger, err: &BootstrapError) {
    let identity = logger.identity();
    tracing::dispatcher::with_default(logger.dispatch(), || {
        tracing::error!(
            fatal = true,
            error = %err,
            state = %err.state(),
            "Program terminated unexpectedly ({identity})!"
        );
    });
}

fn fail(state: &watch::Sender<BootstrapState>, err: BootstrapError) -> BootstrapOutcome {
    state.send_replace(BootstrapState::Failed);
    BootstrapOutcome::Failure(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverOptions;
    use std::path::PathBuf;

    const IDENTITY: ApplicationIdentity = ApplicationIdentity::new("Catalog.API");

    #[test]
    fn errors_report_the_state_they_were_raised_from() {
        let missing = BootstrapError::from(ConfigError::Missing {
            path: PathBuf::from("appsettings.json"),
        });
        assert_eq!(missing.state(), BootstrapState::Init);
        assert!(!missing.is_logged());

        let secret = BootstrapError::from(ConfigError::SecretStore(SecretStoreError::MissingName));
        assert!(matches!(secret, BootstrapError::SecretStore(_)));

        let host = BootstrapError::HostBuild(HostError::ContentRoot {
            path: PathBuf::from("/nowhere"),
        });
        assert_eq!(host.state(), BootstrapState::LoggerReady);
        assert!(host.is_logged());
    }

    #[test]
    fn outcome_maps_to_exit_code() {
        assert_eq!(BootstrapOutcome::Success.exit_code(), 0);
        let failure = BootstrapOutcome::Failure(BootstrapError::LoggerInit(LoggerInitError::NoRuntime));
        assert_eq!(failure.exit_code(), 1);
        assert!(!failure.is_success());
    }

    #[tokio::test]
    async fn missing_configuration_fails_before_logging() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigurationResolver::new(ResolverOptions::new(dir.path()));
        let bootstrap = Bootstrap::new(IDENTITY, resolver, Router::new());
        let state = bootstrap.state();

        let outcome = bootstrap.run(std::future::pending()).await;

        assert!(matches!(
            outcome,
            BootstrapOutcome::Failure(BootstrapError::ConfigLoad(ConfigError::Missing { .. }))
        ));
        assert_eq!(*state.borrow(), BootstrapState::Failed);
    }
}
