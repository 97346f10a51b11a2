//! HTTP hosting subsystem.
//!
//! # Data Flow
//! ```text
//! ResolvedConfiguration + Router + Logger
//!     → server.rs (HostBuilder → Host → BoundHost)
//!         primary port: HTTP/1.1 + HTTP/2
//!         RPC port:     HTTP/2 only
//!     → request.rs (request ID, request span)
//!     → Router
//! ```

pub mod request;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{BoundHost, Host, HostBuilder, HostError, WEB_ROOT};
