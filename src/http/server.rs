//! Host construction and the listen loop.
//!
//! # Responsibilities
//! - Assemble a host from configuration, router and logger
//! - Bind the primary (HTTP/1.1 + HTTP/2) and RPC (HTTP/2 only) listeners
//! - Serve connections until the shutdown future resolves
//! - Drain open connections before returning
//!
//! # Design Decisions
//! - Building does not bind; binding does not serve. The caller decides
//!   when traffic may start
//! - Startup errors propagate unless `capture_startup_errors` is enabled

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tower_http::services::ServeDir;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

use crate::config::schema::{ResolvedConfiguration, MAX_CONCURRENT_CONNECTIONS};
use crate::http::request;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{
    Listener, ListenerError, ListenerOptions, ListenerProtocols, DEFAULT_MAX_CONNECTIONS,
};
use crate::net::ports::{select_ports, PortPair};
use crate::observability::Logger;

/// Static asset directory, relative to the content root.
pub const WEB_ROOT: &str = "Pics";

/// Pause after an accept error that is not tied to a single connection,
/// such as running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Error type for host construction and serving.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("content root {} is not an accessible directory", .path.display())]
    ContentRoot { path: PathBuf },

    #[error("invalid {key}: {value:?}")]
    InvalidSetting { key: &'static str, value: String },

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Builder for a [`Host`].
pub struct HostBuilder {
    router: Router,
    config: Arc<ResolvedConfiguration>,
    ports: Option<PortPair>,
    content_root: PathBuf,
    web_root: PathBuf,
    web_root_mount: Option<String>,
    bind_address: IpAddr,
    capture_startup_errors: bool,
    dispatch: Option<Dispatch>,
}

impl HostBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            config: Arc::default(),
            ports: None,
            content_root: PathBuf::from("."),
            web_root: PathBuf::from(WEB_ROOT),
            web_root_mount: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            capture_startup_errors: false,
            dispatch: None,
        }
    }

    /// Configuration the ports and connection limits are read from.
    pub fn use_configuration(mut self, config: Arc<ResolvedConfiguration>) -> Self {
        self.config = config;
        self
    }

    /// Use these ports instead of `PORT` / `GRPC_PORT`.
    pub fn ports(mut self, ports: PortPair) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn content_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.content_root = path.into();
        self
    }

    /// Static asset directory; relative paths resolve under the content root.
    pub fn web_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.web_root = path.into();
        self
    }

    /// Serve the resolved web root's files under `mount`, e.g. `/pics`.
    pub fn serve_web_root(mut self, mount: impl Into<String>) -> Self {
        self.web_root_mount = Some(mount.into());
        self
    }

    /// Interface to bind; all IPv4 interfaces by default.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// When enabled, bind failures are logged and `run` returns `Ok`.
    pub fn capture_startup_errors(mut self, capture: bool) -> Self {
        self.capture_startup_errors = capture;
        self
    }

    /// Route host and connection logging through `logger`.
    pub fn use_logger(mut self, logger: &Logger) -> Self {
        self.dispatch = Some(logger.dispatch().clone());
        self
    }

    pub fn build(self) -> Result<Host, HostError> {
        let content_root = self
            .content_root
            .canonicalize()
            .ok()
            .filter(|path| path.is_dir())
            .ok_or_else(|| HostError::ContentRoot {
                path: self.content_root.clone(),
            })?;
        let web_root = if self.web_root.is_absolute() {
            self.web_root
        } else {
            content_root.join(&self.web_root)
        };

        let max_connections = match self.config.get(MAX_CONCURRENT_CONNECTIONS) {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(value) => value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| HostError::InvalidSetting {
                    key: MAX_CONCURRENT_CONNECTIONS,
                    value: value.to_string(),
                })?,
        };

        let ports = self.ports.unwrap_or_else(|| select_ports(&self.config));
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));

        let router = match &self.web_root_mount {
            Some(mount) => self.router.nest_service(mount, ServeDir::new(&web_root)),
            None => self.router,
        };

        Ok(Host {
            router: request::instrument(router),
            config: self.config,
            ports,
            content_root,
            web_root,
            bind_address: self.bind_address,
            max_connections,
            capture_startup_errors: self.capture_startup_errors,
            dispatch,
        })
    }
}

/// A configured host that is not listening yet.
pub struct Host {
    router: Router,
    config: Arc<ResolvedConfiguration>,
    ports: PortPair,
    content_root: PathBuf,
    web_root: PathBuf,
    bind_address: IpAddr,
    max_connections: usize,
    capture_startup_errors: bool,
    dispatch: Dispatch,
}

impl Host {
    pub fn ports(&self) -> PortPair {
        self.ports
    }

    pub fn configuration(&self) -> &Arc<ResolvedConfiguration> {
        &self.config
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn listener_options(&self, port: u16, protocols: ListenerProtocols) -> ListenerOptions {
        ListenerOptions {
            address: SocketAddr::new(self.bind_address, port),
            protocols,
            max_connections: self.max_connections,
        }
    }

    /// Bind both listeners without accepting connections yet.
    pub async fn bind(self) -> Result<BoundHost, HostError> {
        let dispatch = self.dispatch.clone();
        async move {
            let primary =
                Listener::bind(self.listener_options(self.ports.primary, ListenerProtocols::Http1AndHttp2))
                    .await?;
            let rpc = Listener::bind(self.listener_options(self.ports.rpc, ListenerProtocols::Http2)).await?;
            Ok(BoundHost {
                router: self.router,
                primary,
                rpc,
                dispatch: self.dispatch,
            })
        }
        .with_subscriber(dispatch)
        .await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), HostError>
    where
        F: Future<Output = ()> + Send,
    {
        let capture = self.capture_startup_errors;
        let dispatch = self.dispatch.clone();
        match self.bind().await {
            Ok(bound) => bound.serve(shutdown).await,
            Err(err) if capture => {
                tracing::dispatcher::with_default(&dispatch, || {
                    tracing::error!(error = %err, "Host startup failed; error captured");
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// A host whose listeners are bound.
pub struct BoundHost {
    router: Router,
    primary: Listener,
    rpc: Listener,
    dispatch: Dispatch,
}

impl BoundHost {
    pub fn primary_addr(&self) -> SocketAddr {
        self.primary.local_addr()
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    /// Serve both listeners until `shutdown` resolves, then drain.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), HostError>
    where
        F: Future<Output = ()> + Send,
    {
        let BoundHost {
            router,
            primary,
            rpc,
            dispatch,
        } = self;
        let task_dispatch = dispatch.clone();

        async move {
            let coordinator = Shutdown::new();
            let tracker = ConnectionTracker::new();

            let result = {
                let serving = async {
                    tokio::try_join!(
                        accept_loop(primary, router.clone(), &coordinator, &tracker, &task_dispatch),
                        accept_loop(rpc, router, &coordinator, &tracker, &task_dispatch),
                    )
                };
                tokio::select! {
                    result = serving => result.map(|_| ()),
                    _ = shutdown => {
                        tracing::info!("Application is shutting down...");
                        Ok(())
                    }
                }
            };

            coordinator.trigger();
            tracker.wait_idle().await;
            tracing::info!("Host stopped");
            result
        }
        .with_subscriber(dispatch)
        .await
    }
}

async fn accept_loop(
    listener: Listener,
    router: Router,
    shutdown: &Shutdown,
    tracker: &ConnectionTracker,
    dispatch: &Dispatch,
) -> Result<(), HostError> {
    let protocols = listener.protocols();
    tracing::info!(
        address = %listener.local_addr(),
        protocols = %protocols,
        "Now listening"
    );

    loop {
        let (stream, peer, permit) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(ListenerError::Accept(e)) => {
                match accept_backoff(&e) {
                    Some(backoff) => {
                        tracing::warn!(address = %listener.local_addr(), error = %e, "Accept failed");
                        tokio::time::sleep(backoff).await;
                    }
                    None => tracing::debug!(error = %e, "Connection dropped during accept"),
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let guard = tracker.track();
        let span = tracing::debug_span!(
            "connection",
            connection_id = %guard.id(),
            peer = %peer,
            protocols = %protocols,
        );
        let service = TowerToHyperService::new(router.clone());
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                let builder = protocols.connection_builder();
                let connection = builder.serve_connection(TokioIo::new(stream), service);
                tokio::pin!(connection);

                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    _ = shutdown_rx.recv() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection closed with error");
                }
            }
            .instrument(span)
            .with_subscriber(dispatch.clone()),
        );
    }
}

/// How long to wait before accepting again. Errors from a single aborted
/// connection retry immediately.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}
