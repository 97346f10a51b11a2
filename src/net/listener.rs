//! TCP listener with backpressure and a fixed protocol set.
//!
//! # Responsibilities
//! - Bind to all interfaces on the selected port
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Build the hyper connection builder matching the listener's protocols

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default per-listener connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    /// The connection limiter was closed.
    #[error("listener on {0} is closed")]
    Closed(SocketAddr),
}

/// HTTP protocols accepted on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocols {
    /// HTTP/1.1 and HTTP/2, negotiated per connection.
    Http1AndHttp2,
    /// HTTP/2 only (prior knowledge), used for streaming RPC.
    Http2,
}

impl ListenerProtocols {
    /// Connection builder restricted to these protocols.
    pub fn connection_builder(self) -> auto::Builder<TokioExecutor> {
        let builder = auto::Builder::new(TokioExecutor::new());
        match self {
            Self::Http1AndHttp2 => builder,
            Self::Http2 => builder.http2_only(),
        }
    }
}

impl fmt::Display for ListenerProtocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http1AndHttp2 => f.write_str("Http1AndHttp2"),
            Self::Http2 => f.write_str("Http2"),
        }
    }
}

/// What to bind.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub address: SocketAddr,
    pub protocols: ListenerProtocols,
    pub max_connections: usize,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    local_addr: SocketAddr,
    protocols: ListenerProtocols,
}

impl Listener {
    pub async fn bind(options: ListenerOptions) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            address: options.address,
            source,
        };
        let inner = TcpListener::bind(options.address).await.map_err(bind_error)?;
        let local_addr = inner.local_addr().map_err(bind_error)?;

        tracing::info!(
            address = %local_addr,
            protocols = %options.protocols,
            max_connections = options.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(options.max_connections)),
            local_addr,
            protocols: options.protocols,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed(self.local_addr))?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::trace!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocols(&self) -> ListenerProtocols {
        self.protocols
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
